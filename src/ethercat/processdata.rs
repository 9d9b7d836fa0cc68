//! Cyclic process data exchange.
//!
//! A send builds one frame per IO segment of a group and pushes the frame
//! index on the index stack; the matching receive drains the stack, copies the
//! inputs into the process image of the group and sums the workcounters.
//! Nothing is retried here, the caller compares the workcounter with
//! [`SlaveGroup::expected_work_counter`].

use std::time::Duration;

use log::{trace, warn};

use crate::{osal::OsalTimer, oshw::nicdrv::NicdrvError};

use super::{
    base::{add_datagram, datagram_data, setup_datagram, work_counter},
    main::{Context, IndexEntry, MainError, SlaveGroup},
    r#type::{
        high_word, low_word, BufferState, CommandType, EthercatRegister, DATAGRAM_HEADER_SIZE,
        FIRST_DATAGRAM_DATA_OFFSET, MAX_LRW_DATA_LENGTH,
    },
};

/// Byte ranges of the logical image covered by the IO segments of a group
fn segments(group: &SlaveGroup, length: usize) -> Vec<(usize, usize)> {
    let mut ranges = Vec::new();
    let mut position = 0;
    for &segment in &group.io_segments {
        if position >= length {
            break;
        }
        let segment = (segment as usize).min(length - position);
        if segment > 0 {
            ranges.push((position, segment));
            position += segment;
        }
    }
    // Images without segmentation are cut at the datagram limit
    while position < length {
        let segment = (length - position).min(MAX_LRW_DATA_LENGTH);
        ranges.push((position, segment));
        position += segment;
    }
    ranges
}

/// Clip ranges to `start..end`
fn clip(ranges: &[(usize, usize)], start: usize, end: usize) -> impl Iterator<Item = (usize, usize)> + '_ {
    ranges.iter().filter_map(move |&(offset, length)| {
        let from = offset.max(start);
        let to = (offset + length).min(end);
        (from < to).then(|| (from, to - from))
    })
}

struct Datagram {
    command: CommandType,
    logical_offset: usize,
    length: usize,

    /// Where the input bytes of the reply go in the io map
    input_offset: usize,

    /// Bytes of the reply before its input bytes
    data_skip: usize,
    input_length: usize,
}

impl Datagram {
    /// Datagram whose reply carries the inputs within `inputs` of the logical
    /// image, stored at `inputs_base` plus their logical offset.
    fn new(
        command: CommandType,
        (logical_offset, length): (usize, usize),
        inputs: (usize, usize),
        inputs_base: usize,
    ) -> Self {
        let end = logical_offset + length;
        // Both bounds stay within the datagram, an empty overlap sits at its edge
        let from = logical_offset.max(inputs.0).min(end);
        let to = end.min(inputs.1).max(from);
        let input_length = if command == CommandType::LogicalWrite { 0 } else { to - from };
        Self {
            command,
            logical_offset,
            length,
            input_offset: inputs_base + from,
            data_skip: from - logical_offset,
            input_length,
        }
    }
}

fn send_datagram(
    context: &Context,
    group: u8,
    datagram: &Datagram,
    io_map: &[u8],
    dc: Option<(u16, i64)>,
) -> Result<(), MainError> {
    let group_ref = context.group(group)?;
    let address = group_ref.logical_start_address + datagram.logical_offset as u32;
    let source = if datagram.command == CommandType::LogicalRead {
        // Read data is filled by the slaves, what is sent is irrelevant
        datagram.input_offset
    } else {
        datagram.logical_offset
    };
    let data = io_map
        .get(source..source + datagram.length)
        .ok_or(NicdrvError::FrameTooLarge(source + datagram.length))?;

    let port = &context.port;
    let index = port.get_index()?;
    let built = port.with_tx_buffer(index, |frame| {
        setup_datagram(frame, datagram.command, index, low_word(address), high_word(address), data)?;
        dc.map(|(reference, time)| {
            add_datagram(
                frame,
                CommandType::FixedReadMultipleWrite,
                index,
                reference,
                EthercatRegister::DistributedClockSystemTime.into(),
                &time.to_le_bytes(),
            )
        })
        .transpose()
    });
    let dc_offset = match built.and_then(|dc_offset| port.out_frame(index).map(|()| dc_offset)) {
        Ok(dc_offset) => dc_offset,
        Err(err) => {
            port.set_buf_stat(index, BufferState::Empty);
            return Err(err.into());
        }
    };
    let pushed = context.index_stack().push(IndexEntry {
        index,
        group,
        command: datagram.command,
        io_offset: datagram.input_offset,
        data_skip: datagram.data_skip,
        input_length: datagram.input_length,
        length: datagram.length,
        frame_offset: FIRST_DATAGRAM_DATA_OFFSET,
        dc_offset,
    });
    if pushed.is_err() {
        port.set_buf_stat(index, BufferState::Empty);
    }
    trace!("group {group} datagram {:?} index {index} sent", datagram.command);
    pushed
}

/// Transmit the process data of a group.
///
/// The outputs are sent as they are in the process image; the group's
/// `block_logical_read_write` selects separate LRD and LWR datagrams instead of
/// LRW. A DC group refreshes the DC time with its first frame.
fn main_send_processdata(context: &Context, group: u8, use_overlap_io: bool) -> Result<(), MainError> {
    let group_ref = context.group(group)?;
    if use_overlap_io != group_ref.overlapped {
        warn!("group {group} overlapped mapping is {}, sending accordingly", group_ref.overlapped);
    }
    let overlap = group_ref.overlapped;
    let output_bytes = group_ref.output_bytes as usize;
    let input_bytes = group_ref.input_bytes as usize;
    let logical_length = if overlap {
        output_bytes.max(input_bytes)
    } else {
        output_bytes + input_bytes
    };
    let ranges = segments(group_ref, logical_length);

    // Inputs follow the outputs in the io map, in an overlapped image they
    // share the logical addresses of the outputs
    let (inputs, inputs_base) = if overlap {
        ((0, input_bytes), output_bytes)
    } else {
        ((output_bytes, logical_length), 0)
    };
    let mut datagrams = Vec::new();
    if !group_ref.block_logical_read_write && output_bytes > 0 {
        for &range in &ranges {
            datagrams.push(Datagram::new(CommandType::LogicalReadWrite, range, inputs, inputs_base));
        }
    } else {
        for range in clip(&ranges, inputs.0, inputs.1) {
            datagrams.push(Datagram::new(CommandType::LogicalRead, range, inputs, inputs_base));
        }
        for range in clip(&ranges, 0, output_bytes) {
            datagrams.push(Datagram::new(CommandType::LogicalWrite, range, inputs, inputs_base));
        }
    }

    let mut dc = if group_ref.has_dc && group_ref.dc_next > 0 {
        let reference = context.slave(group_ref.dc_next, |slave| slave.config_address)?;
        Some((reference, context.dc_time()))
    } else {
        None
    };
    let io_map = group_ref.io_map();
    for datagram in &datagrams {
        send_datagram(context, group, datagram, &io_map, dc.take())?;
    }
    Ok(())
}

/// Transmit the process data of a group
///
/// # Errors
/// Returns an error if no frame index is free or the link failed
pub fn send_processdata_group(context: &Context, group: u8) -> Result<(), MainError> {
    main_send_processdata(context, group, false)
}

/// Transmit the process data of a group mapped with overlapping inputs and
/// outputs, the inputs are returned in place of the outputs.
///
/// # Errors
/// Returns an error if no frame index is free or the link failed
pub fn send_overlap_processdata_group(context: &Context, group: u8) -> Result<(), MainError> {
    main_send_processdata(context, group, true)
}

/// Copy the input part of a returned datagram into the process image
fn store_inputs(group: &SlaveGroup, entry: &IndexEntry, data: &[u8]) {
    if entry.input_length == 0 {
        return;
    }
    let mut io_map = group.io_map();
    let source = data.get(entry.data_skip..entry.data_skip + entry.input_length);
    let target = io_map.get_mut(entry.io_offset..entry.io_offset + entry.input_length);
    if let (Some(target), Some(source)) = (target, source) {
        target.copy_from_slice(source);
    }
}

/// Receive the process data of every frame sent since the last receive.
///
/// Returns the summed workcounter, LWR datagrams count double like the write
/// part of an LRW.
///
/// # Errors
/// Returns [`NicdrvError::NoFrame`] if no frame returned within `timeout`
pub fn receive_processdata_group(context: &Context, group: u8, timeout: Duration) -> Result<u16, MainError> {
    context.group(group)?;
    let timer = OsalTimer::new(timeout);
    let mut wkc: u16 = 0;
    let mut valid = false;
    loop {
        let Some(entry) = context.index_stack().pull() else {
            break;
        };
        let reply = context.port.wait_in_frame(entry.index, timer.remaining());
        context.port.set_buf_stat(entry.index, BufferState::Empty);
        let frame = match reply {
            Ok(frame) => frame,
            Err(NicdrvError::NoFrame) => {
                trace!("frame index {} did not return", entry.index);
                continue;
            }
            Err(err) => return Err(err.into()),
        };

        let command = frame.get(entry.frame_offset - DATAGRAM_HEADER_SIZE).copied();
        if command != Some(u8::from(entry.command)) {
            warn!("frame index {} returned with unexpected command {command:?}", entry.index);
            continue;
        }
        let data = datagram_data(&frame, entry.frame_offset, entry.length)?;
        let datagram_wkc = work_counter(&frame, entry.frame_offset, entry.length)?;
        let target = context.group(entry.group)?;
        if entry.command == CommandType::LogicalWrite {
            wkc = wkc.wrapping_add(datagram_wkc.wrapping_mul(2));
        } else {
            store_inputs(target, &entry, data);
            wkc = wkc.wrapping_add(datagram_wkc);
        }
        if let Some(dc_offset) = entry.dc_offset {
            let time = datagram_data(&frame, dc_offset, 8)?;
            let mut bytes = [0; 8];
            bytes.copy_from_slice(time);
            context.set_dc_time(i64::from_le_bytes(bytes));
        }
        valid = true;
    }
    if valid {
        Ok(wkc)
    } else {
        Err(NicdrvError::NoFrame.into())
    }
}

/// Send the process data of group 0, all slaves
///
/// # Errors
/// Returns an error if no frame index is free or the link failed
pub fn send_processdata(context: &Context) -> Result<(), MainError> {
    send_processdata_group(context, 0)
}

/// # Errors
/// Returns an error if no frame index is free or the link failed
pub fn send_overlap_processdata(context: &Context) -> Result<(), MainError> {
    send_overlap_processdata_group(context, 0)
}

/// Receive the process data of group 0
///
/// # Errors
/// Returns [`NicdrvError::NoFrame`] if no frame returned within `timeout`
pub fn receive_processdata(context: &Context, timeout: Duration) -> Result<u16, MainError> {
    receive_processdata_group(context, 0, timeout)
}
