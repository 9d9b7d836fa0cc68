//! Base EtherCAT functions.
//!
//! Setting up a datagram in an Ethernet frame and the primitive EtherCAT
//! commands: broadcast, auto increment, configured address and logical
//! memory read/write. Every primitive blocks until the frame returned or the
//! timeout expired and returns the workcounter of the reply.

use std::time::Duration;

use crate::oshw::nicdrv::{NicdrvError, Port};

use super::{
    r#type::{
        high_word, low_word, Buffer, BufferState, CommandType, DatagramHeader, DATAGRAM_FOLLOWS,
        DATAGRAM_HEADER_SIZE, ECATTYPE, ETHERCAT_LENGTH_SIZE, ETHERCAT_WORK_COUNTER_SIZE,
        ETHERNET_HEADER_SIZE, FIRST_DATAGRAM_DATA_OFFSET, MAX_LRW_DATA_LENGTH,
    },
    ReadFrom, WriteTo,
};

fn push_bytes(frame: &mut Buffer, bytes: &[u8]) -> Result<(), NicdrvError> {
    frame
        .extend_from_slice(bytes)
        .map_err(|()| NicdrvError::FrameTooLarge(frame.len() + bytes.len()))
}

fn push_datagram(frame: &mut Buffer, header: &DatagramHeader, data: &[u8]) -> Result<usize, NicdrvError> {
    let mut bytes = [0; DATAGRAM_HEADER_SIZE];
    header.write_to(&mut &mut bytes[..])?;
    push_bytes(frame, &bytes)?;
    let data_offset = frame.len();
    push_bytes(frame, data)?;
    push_bytes(frame, &[0; ETHERCAT_WORK_COUNTER_SIZE])?;
    Ok(data_offset)
}

fn write_ethercat_length(frame: &mut Buffer) {
    let length = (frame.len() - ETHERNET_HEADER_SIZE - ETHERCAT_LENGTH_SIZE) as u16;
    frame[ETHERNET_HEADER_SIZE..ETHERNET_HEADER_SIZE + ETHERCAT_LENGTH_SIZE]
        .copy_from_slice(&(length | ECATTYPE).to_le_bytes());
}

/// Replace everything after the Ethernet header of `frame` by one datagram.
///
/// # Errors
/// Returns an error if `data` does not fit a single frame
pub fn setup_datagram(
    frame: &mut Buffer,
    command: CommandType,
    index: u8,
    adp: u16,
    ado: u16,
    data: &[u8],
) -> Result<(), NicdrvError> {
    if data.len() > MAX_LRW_DATA_LENGTH {
        return Err(NicdrvError::FrameTooLarge(data.len()));
    }
    frame.truncate(ETHERNET_HEADER_SIZE);
    push_bytes(frame, &[0; ETHERCAT_LENGTH_SIZE])?;
    let header = DatagramHeader {
        command,
        index,
        address_position: adp,
        address_offset: ado,
        data_length: data.len() as u16,
        interrupt: 0,
    };
    push_datagram(frame, &header, data)?;
    write_ethercat_length(frame);
    Ok(())
}

/// Offsets of every datagram header in a frame
fn datagram_offsets(frame: &[u8]) -> impl Iterator<Item = (usize, DatagramHeader)> + '_ {
    let mut offset = Some(ETHERNET_HEADER_SIZE + ETHERCAT_LENGTH_SIZE);
    std::iter::from_fn(move || {
        let start = offset?;
        let header = DatagramHeader::read_from(&mut frame.get(start..)?).ok()?;
        offset = header
            .more_follows()
            .then_some(start + DATAGRAM_HEADER_SIZE + header.length() + ETHERCAT_WORK_COUNTER_SIZE);
        Some((start, header))
    })
}

/// Append a datagram to a frame prepared with [`setup_datagram`], flagging the
/// previous last datagram as followed.
///
/// Returns the offset of the data of the new datagram within the frame.
///
/// # Errors
/// Returns an error if the datagram does not fit the frame
pub fn add_datagram(
    frame: &mut Buffer,
    command: CommandType,
    index: u8,
    adp: u16,
    ado: u16,
    data: &[u8],
) -> Result<usize, NicdrvError> {
    let (last, mut previous) = datagram_offsets(frame)
        .last()
        .ok_or(NicdrvError::InvalidFrame)?;
    previous.data_length |= DATAGRAM_FOLLOWS;
    let mut bytes = [0; DATAGRAM_HEADER_SIZE];
    previous.write_to(&mut &mut bytes[..])?;
    frame[last..last + DATAGRAM_HEADER_SIZE].copy_from_slice(&bytes);

    let header = DatagramHeader {
        command,
        index,
        address_position: adp,
        address_offset: ado,
        data_length: data.len() as u16,
        interrupt: 0,
    };
    let data_offset = push_datagram(frame, &header, data)?;
    write_ethercat_length(frame);
    Ok(data_offset)
}

/// Data of the datagram at `data_offset` in a received frame
///
/// # Errors
/// Returns [`NicdrvError::InvalidFrame`] if the frame is too short
pub fn datagram_data(frame: &[u8], data_offset: usize, length: usize) -> Result<&[u8], NicdrvError> {
    frame
        .get(data_offset..data_offset + length)
        .ok_or(NicdrvError::InvalidFrame)
}

/// Workcounter following the data of the datagram at `data_offset`
///
/// # Errors
/// Returns [`NicdrvError::InvalidFrame`] if the frame is too short
pub fn work_counter(frame: &[u8], data_offset: usize, length: usize) -> Result<u16, NicdrvError> {
    let start = data_offset + length;
    frame
        .get(start..start + ETHERCAT_WORK_COUNTER_SIZE)
        .map(|bytes| u16::from_le_bytes([bytes[0], bytes[1]]))
        .ok_or(NicdrvError::InvalidFrame)
}

/// Send a single datagram and wait for its reply, the frame index is always released.
fn exchange(
    port: &Port,
    command: CommandType,
    adp: u16,
    ado: u16,
    data: &[u8],
    timeout: Duration,
) -> Result<(Buffer, u16), NicdrvError> {
    let index = port.get_index()?;
    let result = port
        .with_tx_buffer(index, |frame| setup_datagram(frame, command, index, adp, ado, data))
        .and_then(|()| port.src_confirm(index, timeout));
    port.set_buf_stat(index, BufferState::Empty);
    let reply = result?;
    let wkc = work_counter(&reply, FIRST_DATAGRAM_DATA_OFFSET, data.len())?;
    Ok((reply, wkc))
}

fn exchange_read(
    port: &Port,
    command: CommandType,
    adp: u16,
    ado: u16,
    data: &mut [u8],
    timeout: Duration,
) -> Result<u16, NicdrvError> {
    let (reply, wkc) = exchange(port, command, adp, ado, data, timeout)?;
    data.copy_from_slice(datagram_data(&reply, FIRST_DATAGRAM_DATA_OFFSET, data.len())?);
    Ok(wkc)
}

/// Broadcast write primitive (blocking)
///
/// # Errors
/// Returns an error if the frame did not return
pub fn bwr(port: &Port, adp: u16, ado: u16, data: &[u8], timeout: Duration) -> Result<u16, NicdrvError> {
    exchange(port, CommandType::BroadcastWrite, adp, ado, data, timeout).map(|(_, wkc)| wkc)
}

/// Broadcast read primitive (blocking), slaves OR their data into `data`
///
/// # Errors
/// Returns an error if the frame did not return
pub fn brd(port: &Port, adp: u16, ado: u16, data: &mut [u8], timeout: Duration) -> Result<u16, NicdrvError> {
    exchange_read(port, CommandType::BroadcastRead, adp, ado, data, timeout)
}

/// Auto increment address read primitive (blocking)
///
/// # Errors
/// Returns an error if the frame did not return
pub fn aprd(port: &Port, adp: u16, ado: u16, data: &mut [u8], timeout: Duration) -> Result<u16, NicdrvError> {
    exchange_read(port, CommandType::AutoPointerRead, adp, ado, data, timeout)
}

/// Auto increment address read of one word, 0 if no slave answered
///
/// # Errors
/// Returns an error if the frame did not return
pub fn aprdw(port: &Port, adp: u16, ado: u16, timeout: Duration) -> Result<u16, NicdrvError> {
    let mut word = [0; 2];
    aprd(port, adp, ado, &mut word, timeout)?;
    Ok(u16::from_le_bytes(word))
}

/// Auto increment address write primitive (blocking)
///
/// # Errors
/// Returns an error if the frame did not return
pub fn apwr(port: &Port, adp: u16, ado: u16, data: &[u8], timeout: Duration) -> Result<u16, NicdrvError> {
    exchange(port, CommandType::AutoPointerWrite, adp, ado, data, timeout).map(|(_, wkc)| wkc)
}

/// # Errors
/// Returns an error if the frame did not return
pub fn apwrw(port: &Port, adp: u16, ado: u16, data: u16, timeout: Duration) -> Result<u16, NicdrvError> {
    apwr(port, adp, ado, &data.to_le_bytes(), timeout)
}

/// Configured address read primitive (blocking)
///
/// # Errors
/// Returns an error if the frame did not return
pub fn fprd(port: &Port, adp: u16, ado: u16, data: &mut [u8], timeout: Duration) -> Result<u16, NicdrvError> {
    exchange_read(port, CommandType::FixedPointerRead, adp, ado, data, timeout)
}

/// # Errors
/// Returns an error if the frame did not return
pub fn fprdw(port: &Port, adp: u16, ado: u16, timeout: Duration) -> Result<u16, NicdrvError> {
    let mut word = [0; 2];
    fprd(port, adp, ado, &mut word, timeout)?;
    Ok(u16::from_le_bytes(word))
}

/// Configured address write primitive (blocking)
///
/// # Errors
/// Returns an error if the frame did not return
pub fn fpwr(port: &Port, adp: u16, ado: u16, data: &[u8], timeout: Duration) -> Result<u16, NicdrvError> {
    exchange(port, CommandType::FixedPointerWrite, adp, ado, data, timeout).map(|(_, wkc)| wkc)
}

/// # Errors
/// Returns an error if the frame did not return
pub fn fpwrw(port: &Port, adp: u16, ado: u16, data: u16, timeout: Duration) -> Result<u16, NicdrvError> {
    fpwr(port, adp, ado, &data.to_le_bytes(), timeout)
}

/// Configured address read, multiple write. The addressed slave's data is
/// written into every following slave, used to distribute the reference clock.
///
/// # Errors
/// Returns an error if the frame did not return
pub fn frmw(port: &Port, adp: u16, ado: u16, data: &mut [u8], timeout: Duration) -> Result<u16, NicdrvError> {
    exchange_read(port, CommandType::FixedReadMultipleWrite, adp, ado, data, timeout)
}

/// Logical memory read primitive (blocking)
///
/// # Errors
/// Returns an error if the frame did not return
pub fn lrd(port: &Port, logical_address: u32, data: &mut [u8], timeout: Duration) -> Result<u16, NicdrvError> {
    exchange_read(
        port,
        CommandType::LogicalRead,
        low_word(logical_address),
        high_word(logical_address),
        data,
        timeout,
    )
}

/// Logical memory write primitive (blocking)
///
/// # Errors
/// Returns an error if the frame did not return
pub fn lwr(port: &Port, logical_address: u32, data: &[u8], timeout: Duration) -> Result<u16, NicdrvError> {
    exchange(
        port,
        CommandType::LogicalWrite,
        low_word(logical_address),
        high_word(logical_address),
        data,
        timeout,
    )
    .map(|(_, wkc)| wkc)
}

/// Logical memory read/write primitive (blocking)
///
/// # Errors
/// Returns an error if the frame did not return
pub fn lrw(port: &Port, logical_address: u32, data: &mut [u8], timeout: Duration) -> Result<u16, NicdrvError> {
    exchange_read(
        port,
        CommandType::LogicalReadWrite,
        low_word(logical_address),
        high_word(logical_address),
        data,
        timeout,
    )
}
