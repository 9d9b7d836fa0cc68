//! CAN over EtherCAT module.
//!
//! SDO read/write over the mailbox of a slave, expedited or as a single
//! normal transfer.

use std::{
    io::{self, Read, Write},
    time::{Duration, SystemTime},
};

use log::{trace, warn};

use super::{
    mailbox::{mailbox_receive, mailbox_send, next_slave_mailbox_count, release_mailbox, MailboxBuffer},
    main::{packet_error, push_error, Context, MailboxHeader, MainError, PacketError, MAILBOX_HEADER_SIZE},
    r#type::{
        AbortError, COEMailboxType, CanopenOverEthercatSdoCommand, ErrorInfo, ErrorType, MailboxType,
        TIMEOUT_TX_MAILBOX,
    },
    ReadFrom, WriteTo,
};

/// Mailbox header, CoE header, command, index and subindex
const SDO_HEADER_SIZE: usize = MAILBOX_HEADER_SIZE + 6;

/// Mailbox length of an SDO without data beyond its 4 byte data field
const SDO_BASE_LENGTH: u16 = 10;

/// Upload response, lower bits carry the transfer type
const SDO_UPLOAD_RESPONSE: u8 = 0x40;
const SDO_DOWNLOAD_RESPONSE: u8 = 0x60;

/// Expedited and size indicated bits of the command
const SDO_EXPEDITED: u8 = 0x02;
const SDO_SIZE_INDICATED: u8 = 0x01;

#[derive(Debug, thiserror::Error)]
pub enum CoEError {
    #[error(transparent)]
    Mailbox(#[from] MainError),

    #[error("malformed SDO")]
    Io(#[from] io::Error),

    /// The slave aborted the transfer
    #[error("SDO {index:#06x}:{sub_index} aborted with {code:#010x}")]
    Abort { index: u16, sub_index: u8, code: u32 },

    #[error("unexpected SDO response")]
    UnexpectedResponse,

    /// The transfer is empty or needs segmentation
    #[error("SDO of {0} bytes cannot be transferred in a single mailbox")]
    InvalidSDOSize(usize),
}

/// Service Data Object header in front of the SDO data
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServiceDataObject {
    pub mailbox_header: MailboxHeader,

    /// CoE service in the upper nibble
    pub can_open: u16,
    pub command: u8,
    pub index: u16,
    pub sub_index: u8,
}

impl ServiceDataObject {
    fn request(length: u16, count: u8, command: u8, index: u16, sub_index: u8) -> Self {
        Self {
            mailbox_header: MailboxHeader::new(length, MailboxType::CanopenOverEthercat, count),
            can_open: u16::from(COEMailboxType::SdoRequest) << 12,
            command,
            index,
            sub_index,
        }
    }

    fn service(&self) -> u16 {
        self.can_open >> 12
    }
}

impl<R: Read> ReadFrom<R> for ServiceDataObject {
    type Err = io::Error;

    fn read_from(reader: &mut R) -> Result<Self, Self::Err> {
        Ok(Self {
            mailbox_header: MailboxHeader::read_from(reader)?,
            can_open: u16::read_from(reader)?,
            command: u8::read_from(reader)?,
            index: u16::read_from(reader)?,
            sub_index: u8::read_from(reader)?,
        })
    }
}

impl<W: Write> WriteTo<W> for ServiceDataObject {
    fn write_to(&self, writer: &mut W) -> io::Result<()> {
        self.mailbox_header.write_to(writer)?;
        writer.write_all(&self.can_open.to_le_bytes())?;
        writer.write_all(&[self.command])?;
        writer.write_all(&self.index.to_le_bytes())?;
        writer.write_all(&[self.sub_index])
    }
}

/// Report an SDO abort on the error list
fn sdo_error(context: &Context, slave: u16, index: u16, sub_index: u8, code: u32) {
    push_error(
        context,
        ErrorInfo {
            time: SystemTime::now(),
            signal: true,
            slave,
            index,
            sub_index,
            error_type: ErrorType::ServiceDataObjectError,
            abort_error: AbortError::Abort(code),
        },
    );
}

/// Send an SDO request and wait for the CoE reply, returning the reply header
/// and its bytes behind the header
fn transfer(
    context: &Context,
    slave: u16,
    request: &ServiceDataObject,
    data: &[u8],
    timeout: Duration,
) -> Result<(ServiceDataObject, Vec<u8>), CoEError> {
    // Empty slave out mailbox, if something is in it
    if let Ok(stale) = mailbox_receive(context, slave, MailboxType::CanopenOverEthercat, Duration::ZERO) {
        trace!("slave {slave} stale CoE mailbox dropped");
        release_mailbox(context, stale);
    }

    let mut buffer = context.mailbox_pool().lease()?;
    if let Err(err) = fill(&mut buffer, request, data) {
        release_mailbox(context, buffer);
        return Err(err);
    }
    mailbox_send(context, slave, buffer, TIMEOUT_TX_MAILBOX)?;

    let reply = mailbox_receive(context, slave, MailboxType::CanopenOverEthercat, timeout)?;
    let parsed = parse(&reply);
    release_mailbox(context, reply);
    parsed
}

fn fill(buffer: &mut MailboxBuffer, request: &ServiceDataObject, data: &[u8]) -> Result<(), CoEError> {
    let mut writer = buffer.as_mut();
    request.write_to(&mut writer)?;
    writer.write_all(data)?;
    Ok(())
}

fn parse(reply: &MailboxBuffer) -> Result<(ServiceDataObject, Vec<u8>), CoEError> {
    let mut reader = reply.as_ref();
    let header = ServiceDataObject::read_from(&mut reader)?;
    let length = usize::from(header.mailbox_header.length) + MAILBOX_HEADER_SIZE;
    let data = reply
        .as_ref()
        .get(SDO_HEADER_SIZE..length.max(SDO_HEADER_SIZE))
        .ok_or(CoEError::InvalidSDOSize(length))?;
    Ok((header, data.to_vec()))
}

/// Handle a reply that is no expected response
fn unexpected(
    context: &Context,
    slave: u16,
    index: u16,
    sub_index: u8,
    reply: &ServiceDataObject,
    data: &[u8],
) -> CoEError {
    if reply.command == u8::from(CanopenOverEthercatSdoCommand::Abort) {
        let code = data
            .get(..4)
            .map_or(0, |code| u32::from_le_bytes([code[0], code[1], code[2], code[3]]));
        warn!("slave {slave} aborted SDO {index:#06x}:{sub_index} with {code:#010x}");
        sdo_error(context, slave, index, sub_index, code);
        CoEError::Abort {
            index,
            sub_index,
            code,
        }
    } else {
        packet_error(context, slave, index, sub_index, PacketError::UnexpectedFrameReturned);
        CoEError::UnexpectedResponse
    }
}

fn is_response_to(reply: &ServiceDataObject, index: u16, sub_index: u8) -> bool {
    reply.mailbox_header.protocol().ok() == Some(MailboxType::CanopenOverEthercat)
        && reply.service() == u16::from(COEMailboxType::SdoResponse)
        && reply.index == index
        && reply.sub_index == sub_index
}

/// CANopen over EtherCAT Service Data Object read (blocking).
///
/// Only a "normal" upload request is issued. If the requested parameter <= 4 bytes,
/// an "expedited" response is returned, otherwise a "normal" response which has
/// to fit a single mailbox.
///
/// # Parameters
/// - `context`: Context struct
/// - `slave`: Slave number
/// - `index`: Index to read
/// - `sub_index`: Subindex to read
/// - `parameter_buffer`: Buffer the parameter is copied to
/// - `timeout`: Timeout duration, standard is `TIMEOUT_RX_MAILBOX`
///
/// # Returns
/// Bytes read into `parameter_buffer`
///
/// # Errors
/// Returns an error if the mailbox exchange failed, the slave aborted the
/// transfer or the parameter does not fit `parameter_buffer`
pub fn sdo_read(
    context: &Context,
    slave: u16,
    index: u16,
    sub_index: u8,
    parameter_buffer: &mut [u8],
    timeout: Duration,
) -> Result<usize, CoEError> {
    // Mailbox count is used as session handle
    let count = next_slave_mailbox_count(context, slave)?;
    let request = ServiceDataObject::request(
        SDO_BASE_LENGTH,
        count,
        CanopenOverEthercatSdoCommand::UpReq.into(),
        index,
        sub_index,
    );
    let (reply, data) = transfer(context, slave, &request, &[0; 4], timeout)?;
    if !is_response_to(&reply, index, sub_index) || reply.command & 0xE0 != SDO_UPLOAD_RESPONSE {
        return Err(unexpected(context, slave, index, sub_index, &reply, &data));
    }

    let bytes = if reply.command & SDO_EXPEDITED != 0 {
        // Expedited frame, the unused byte count is given when the size is indicated
        let unused = if reply.command & SDO_SIZE_INDICATED != 0 {
            usize::from((reply.command >> 2) & 0x03)
        } else {
            0
        };
        data.get(..4 - unused).ok_or(CoEError::UnexpectedResponse)?
    } else {
        // Normal frame, complete size followed by the data
        let size = data
            .get(..4)
            .map(|size| u32::from_le_bytes([size[0], size[1], size[2], size[3]]) as usize)
            .ok_or(CoEError::UnexpectedResponse)?;
        data.get(4..4 + size).ok_or(CoEError::InvalidSDOSize(size))?
    };
    if bytes.len() > parameter_buffer.len() {
        packet_error(context, slave, index, sub_index, PacketError::DataContainerTooSmallForType);
        return Err(CoEError::InvalidSDOSize(bytes.len()));
    }
    parameter_buffer[..bytes.len()].copy_from_slice(bytes);
    Ok(bytes.len())
}

/// CANopen over EtherCAT Service Data Object write (blocking).
///
/// Up to 4 bytes go as an expedited download, larger parameters as a normal
/// download that has to fit the write mailbox of the slave.
///
/// # Errors
/// Returns an error if the mailbox exchange failed, the slave aborted the
/// transfer or the parameter is empty or does not fit a single mailbox
pub fn sdo_write(
    context: &Context,
    slave: u16,
    index: u16,
    sub_index: u8,
    parameter: &[u8],
    timeout: Duration,
) -> Result<(), CoEError> {
    // An expedited download carries 1 to 4 bytes
    if parameter.is_empty() {
        return Err(CoEError::InvalidSDOSize(0));
    }
    let mailbox_length = context.slave(slave, |entry| usize::from(entry.mailbox_length))?;
    let count = next_slave_mailbox_count(context, slave)?;
    let (request, data) = if parameter.len() <= 4 {
        let mut data = [0; 4];
        data[..parameter.len()].copy_from_slice(parameter);
        let unused = (4 - parameter.len()) as u8;
        let command = u8::from(CanopenOverEthercatSdoCommand::DownExp) | (unused << 2);
        (
            ServiceDataObject::request(SDO_BASE_LENGTH, count, command, index, sub_index),
            data.to_vec(),
        )
    } else {
        if SDO_HEADER_SIZE + 4 + parameter.len() > mailbox_length {
            return Err(CoEError::InvalidSDOSize(parameter.len()));
        }
        let mut data = Vec::with_capacity(4 + parameter.len());
        data.extend_from_slice(&(parameter.len() as u32).to_le_bytes());
        data.extend_from_slice(parameter);
        let length = SDO_BASE_LENGTH + parameter.len() as u16;
        (
            ServiceDataObject::request(length, count, CanopenOverEthercatSdoCommand::DownInit.into(), index, sub_index),
            data,
        )
    };

    let (reply, data) = transfer(context, slave, &request, &data, timeout)?;
    if is_response_to(&reply, index, sub_index) && reply.command == SDO_DOWNLOAD_RESPONSE {
        Ok(())
    } else {
        Err(unexpected(context, slave, index, sub_index, &reply, &data))
    }
}
