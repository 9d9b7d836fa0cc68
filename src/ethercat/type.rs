//! General types and constants for EtherCAT.
//!
//! Constants that could need optimization for specific applications
//! are the `TIMEOUT_xxx`. Assumptions for the standard settings are a
//! standard Linux PC or laptop and a wired connection maximal 100 slaves.
//! For use with wireless connections or lots of slaves, the timeouts need
//! increasing. For fast systems running Xenomai and RT-net or alike the
//! timeouts need to be shorter.

use std::{
    array,
    io::{self, Read, Write},
    time::{Duration, SystemTime},
};

use crate::oshw::{host_to_network, network_to_host, Network};

use super::{
    main::{MainError, PacketError},
    ReadFrom, WriteTo,
};

/// Maximum EtherCAT frame length in bytes
pub const MAX_ECAT_FRAME_LENGTH: usize = 1518;

/// Ethernet header size
pub const ETHERNET_HEADER_SIZE: usize = 14;

/// Size of the EtherCAT frame length word
pub const ETHERCAT_LENGTH_SIZE: usize = size_of::<u16>();

/// Size of a datagram header (command up to interrupt)
pub const DATAGRAM_HEADER_SIZE: usize = 10;

/// EtherCAT header size, frame length word plus the first datagram header
pub const ETHERCAT_HEADER_SIZE: usize = ETHERCAT_LENGTH_SIZE + DATAGRAM_HEADER_SIZE;

/// Size of workcounter item in EtherCAT datagram
pub const ETHERCAT_WORK_COUNTER_SIZE: usize = size_of::<u16>();

/// Offset of the command of the first datagram in a frame
pub const ETHERCAT_COMMAND_OFFSET: usize = ETHERNET_HEADER_SIZE + ETHERCAT_LENGTH_SIZE;

/// Offset of the index of the first datagram in a frame
pub const ETHERCAT_INDEX_OFFSET: usize = ETHERCAT_COMMAND_OFFSET + 1;

/// Offset of the data of the first datagram in a frame
pub const FIRST_DATAGRAM_DATA_OFFSET: usize = ETHERNET_HEADER_SIZE + ETHERCAT_HEADER_SIZE;

const FCS_SIZE: usize = 4;

/// Maximum EtherCAT LRW frame length in bytes
pub const MAX_LRW_DATA_LENGTH: usize = MAX_ECAT_FRAME_LENGTH
    - ETHERNET_HEADER_SIZE
    - ETHERCAT_LENGTH_SIZE
    - DATAGRAM_HEADER_SIZE
    - ETHERCAT_WORK_COUNTER_SIZE
    - FCS_SIZE;

/// Size of DC datagram used in first LRW frame
pub const FIRST_DC_DATAGRAM_SIZE: usize = 20;

/// Standard frame buffer size in bytes
pub const BUFSIZE: usize = MAX_ECAT_FRAME_LENGTH;

/// Datagram type EtherCAT
pub const ECATTYPE: u16 = 0x1000;

/// Number of frame buffers per channel
pub const MAX_BUF_COUNT: usize = 16;

/// Timeout value for tx frame to return to rx
pub const TIMEOUT_RETURN: Duration = Duration::from_micros(2000);

/// Timeout value for safe data transfer, max. triple retry
pub const TIMEOUT_RET3: Duration = Duration::from_micros(2000 * 3);

/// Timeout value for return "safe" variant (f.e. wireless)
pub const TIMEOUT_SAFE: Duration = Duration::from_micros(20_000);

/// Timeout value for tx mailbox cycle
pub const TIMEOUT_TX_MAILBOX: Duration = Duration::from_micros(20_000);

/// Timeout value for rx mailbox cycle
pub const TIMEOUT_RX_MAILBOX: Duration = Duration::from_micros(700_000);

/// Timeout value for check statechange
pub const TIMEOUT_STATE: Duration = Duration::from_micros(2_000_000);

/// Timeout value used by the recovery scan for reconfiguration and recovery
pub const TIMEOUT_MONITOR: Duration = Duration::from_micros(500);

/// Default group size in 2^x
pub const LOG_GROUP_OFFSET: u8 = 16;

/// Ethercat packet type
pub const ETH_P_ECAT: u16 = 0x88A4;

/// Definition of datagram follows bit in the datagram length field
pub const DATAGRAM_FOLLOWS: u16 = 1 << 15;

/// Bits of the datagram length field carrying the data length
pub const DATAGRAM_LENGTH_MASK: u16 = 0x07FF;

pub type Buffer = heapless::Vec<u8, BUFSIZE>;

/// Ethernet header definition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EthernetHeader {
    /// Destination MAC
    pub destination_address: [Network<u16>; 3],

    /// Source MAC
    pub source_address: [Network<u16>; 3],

    /// Ethernet type
    pub etype: Network<u16>,
}

impl EthernetHeader {
    /// Broadcast header sourced from `mac`
    pub fn new(mac: [u16; 3]) -> Self {
        Self {
            destination_address: array::from_fn(|_| host_to_network(0xFFFF)),
            source_address: array::from_fn(|i| host_to_network(mac[i])),
            etype: host_to_network(ETH_P_ECAT),
        }
    }
}

impl<R: Read> ReadFrom<R> for EthernetHeader {
    type Err = io::Error;

    fn read_from(reader: &mut R) -> Result<Self, Self::Err> {
        let mut word = || -> io::Result<Network<u16>> {
            let bytes = <[u8; 2]>::read_from(&mut *reader)?;
            Ok(host_to_network(u16::from_be_bytes(bytes)))
        };
        Ok(Self {
            destination_address: [word()?, word()?, word()?],
            source_address: [word()?, word()?, word()?],
            etype: word()?,
        })
    }
}

impl<W: Write> WriteTo<W> for EthernetHeader {
    fn write_to(&self, writer: &mut W) -> io::Result<()> {
        for word in self
            .destination_address
            .iter()
            .chain(&self.source_address)
            .chain([&self.etype])
        {
            writer.write_all(&network_to_host(*word).to_be_bytes())?;
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid command type {0}")]
pub struct InvalidCommandType(pub u8);

/// EtherCAT command types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandType {
    /// No operation
    Nop,

    /// Auto increment read
    AutoPointerRead,

    /// Auto increment write
    AutoPointerWrite,

    /// Auto increment read/write
    AutoPointerReadWrite,

    /// Configured address read
    FixedPointerRead,

    /// Configured address write
    FixedPointerWrite,

    /// Configured address read/write
    FixedPointerReadWrite,

    /// Broadcast read
    BroadcastRead,

    /// Broadcast write
    BroadcastWrite,

    /// Broadcast read/write
    BroadcastReadWrite,

    /// Logical memory read
    LogicalRead,

    /// Logical memory write
    LogicalWrite,

    /// Logical memory read/write
    LogicalReadWrite,

    /// Auto increment read multiple write
    AutoReadMultipleWrite,

    /// Configured read multiple write
    FixedReadMultipleWrite,
}

impl From<CommandType> for u8 {
    fn from(value: CommandType) -> Self {
        value as u8
    }
}

impl TryFrom<u8> for CommandType {
    type Error = InvalidCommandType;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(CommandType::Nop),
            1 => Ok(CommandType::AutoPointerRead),
            2 => Ok(CommandType::AutoPointerWrite),
            3 => Ok(CommandType::AutoPointerReadWrite),
            4 => Ok(CommandType::FixedPointerRead),
            5 => Ok(CommandType::FixedPointerWrite),
            6 => Ok(CommandType::FixedPointerReadWrite),
            7 => Ok(CommandType::BroadcastRead),
            8 => Ok(CommandType::BroadcastWrite),
            9 => Ok(CommandType::BroadcastReadWrite),
            10 => Ok(CommandType::LogicalRead),
            11 => Ok(CommandType::LogicalWrite),
            12 => Ok(CommandType::LogicalReadWrite),
            13 => Ok(CommandType::AutoReadMultipleWrite),
            14 => Ok(CommandType::FixedReadMultipleWrite),
            _ => Err(InvalidCommandType(value)),
        }
    }
}

/// Header in front of the data of every datagram.
///
/// The first datagram of a frame is additionally preceded by the EtherCAT
/// frame length word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatagramHeader {
    pub command: CommandType,

    /// Index used for Tx to Rx recombination
    pub index: u8,

    /// EtherCAT address
    pub address_position: u16,
    pub address_offset: u16,

    /// Length of data plus the circulating and more-follows flags
    pub data_length: u16,

    /// Interrupt, currently unused
    pub interrupt: u16,
}

impl DatagramHeader {
    pub const fn length(&self) -> usize {
        (self.data_length & DATAGRAM_LENGTH_MASK) as usize
    }

    pub const fn more_follows(&self) -> bool {
        self.data_length & DATAGRAM_FOLLOWS != 0
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DatagramHeaderError {
    #[error("datagram header truncated")]
    WrongSize(#[from] io::Error),

    #[error(transparent)]
    InvalidCommandType(#[from] InvalidCommandType),
}

impl<R: Read> ReadFrom<R> for DatagramHeader {
    type Err = DatagramHeaderError;

    fn read_from(reader: &mut R) -> Result<Self, Self::Err> {
        let value = <[u8; DATAGRAM_HEADER_SIZE]>::read_from(reader)?;
        Ok(Self {
            command: CommandType::try_from(value[0])?,
            index: value[1],
            address_position: u16::from_le_bytes([value[2], value[3]]),
            address_offset: u16::from_le_bytes([value[4], value[5]]),
            data_length: u16::from_le_bytes([value[6], value[7]]),
            interrupt: u16::from_le_bytes([value[8], value[9]]),
        })
    }
}

impl<W: Write> WriteTo<W> for DatagramHeader {
    fn write_to(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(&[u8::from(self.command), self.index])?;
        writer.write_all(&self.address_position.to_le_bytes())?;
        writer.write_all(&self.address_offset.to_le_bytes())?;
        writer.write_all(&self.data_length.to_le_bytes())?;
        writer.write_all(&self.interrupt.to_le_bytes())
    }
}

/// Application layer states, ordered from lowest to highest
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum EthercatState {
    /// No valid state
    #[default]
    None = 0,

    /// Init state
    Init = 1,

    /// Pre-operational
    PreOperational = 2,

    /// Boot state
    Boot = 3,

    /// Safe-operational
    SafeOperational = 4,

    /// Operational
    Operational = 8,
}

/// Error indication bit in the AL status register
pub const STATE_ERROR: u16 = 0x10;

/// Error acknowledge bit in the AL control register
pub const STATE_ACK: u16 = 0x10;

const STATE_MASK: u16 = 0x0F;

impl From<EthercatState> for u8 {
    fn from(value: EthercatState) -> Self {
        value as u8
    }
}

impl From<EthercatState> for u16 {
    fn from(value: EthercatState) -> Self {
        u16::from(u8::from(value))
    }
}

impl TryFrom<u8> for EthercatState {
    type Error = MainError;

    fn try_from(value: u8) -> Result<Self, MainError> {
        match value {
            0 => Ok(EthercatState::None),
            1 => Ok(EthercatState::Init),
            2 => Ok(EthercatState::PreOperational),
            3 => Ok(EthercatState::Boot),
            4 => Ok(EthercatState::SafeOperational),
            8 => Ok(EthercatState::Operational),
            _ => Err(MainError::InvalidEthercatState(value)),
        }
    }
}

/// State of a slave as seen in its AL status register: one of the
/// [`EthercatState`]s with the error flag on top.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SlaveState {
    pub state: EthercatState,
    pub error: bool,
}

impl SlaveState {
    pub const NONE: Self = Self::new(EthercatState::None);

    pub const fn new(state: EthercatState) -> Self {
        Self {
            state,
            error: false,
        }
    }

    /// `state` with the error (status) or acknowledge (control) bit set
    pub const fn with_error(state: EthercatState) -> Self {
        Self { state, error: true }
    }

    /// Decode an AL status register value
    ///
    /// # Errors
    /// Returns an error if the state nibble is not a defined state
    pub fn from_raw(raw: u16) -> Result<Self, MainError> {
        Ok(Self {
            state: EthercatState::try_from((raw & STATE_MASK) as u8)?,
            error: raw & STATE_ERROR != 0,
        })
    }

    pub fn to_raw(self) -> u16 {
        u16::from(self.state) | if self.error { STATE_ERROR } else { 0 }
    }
}

impl From<EthercatState> for SlaveState {
    fn from(value: EthercatState) -> Self {
        Self::new(value)
    }
}

/// Possible buffer states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BufferState {
    /// Empty
    #[default]
    Empty,

    /// Allocated but not failed
    Alloc,

    /// Transmitted
    Tx,

    /// Received but not consumed
    Rcvd,

    /// Cycle complete
    Complete,
}

/// Mailbox types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailboxType {
    /// Error mailbox
    Error,

    /// ADS over EtherCAT
    AdsOverEthercat,

    /// Ethernet over EtherCAT
    EthernetOverEthercat,

    /// CANopen over EtherCAT
    CanopenOverEthercat,

    /// File over EtherCAT
    FileOverEthercat,

    /// Servo over EtherCAT
    ServoOverEthercat,

    /// Vendor over EtherCAT
    VendorOverEthercat = 0xF,
}

impl From<MailboxType> for u8 {
    fn from(value: MailboxType) -> Self {
        value as u8
    }
}

impl TryFrom<u8> for MailboxType {
    type Error = MainError;

    fn try_from(value: u8) -> Result<Self, MainError> {
        match value {
            0 => Ok(MailboxType::Error),
            1 => Ok(MailboxType::AdsOverEthercat),
            2 => Ok(MailboxType::EthernetOverEthercat),
            3 => Ok(MailboxType::CanopenOverEthercat),
            4 => Ok(MailboxType::FileOverEthercat),
            5 => Ok(MailboxType::ServoOverEthercat),
            0xF => Ok(MailboxType::VendorOverEthercat),
            _ => Err(MainError::InvalidMailboxType(value)),
        }
    }
}

/// CANopen over EtherCat mailbox types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum COEMailboxType {
    Emergency = 1,

    /// Service Data Object request
    SdoRequest,

    /// Service Data Object response
    SdoResponse,

    /// Send process data object
    TxPdo,

    /// Receive process data object
    RxPdo,

    /// Send process data object RR
    TxPdoRR,

    /// Receive process data object RR
    RxPdoRR,

    /// Service data object information
    SdoInfo,
}

impl From<COEMailboxType> for u16 {
    fn from(value: COEMailboxType) -> Self {
        value as u16
    }
}

/// CANopen over EtherCAT Service Data Object commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CanopenOverEthercatSdoCommand {
    /// Download initiate
    DownInit = 0x21,

    /// Download expedited
    DownExp = 0x23,

    /// Upload request
    UpReq = 0x40,

    /// Abort
    Abort = 0x80,
}

impl From<CanopenOverEthercatSdoCommand> for u8 {
    fn from(value: CanopenOverEthercatSdoCommand) -> Self {
        value as u8
    }
}

/// Registers of the EtherCAT slave controller used by the master
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum EthercatRegister {
    Type = 0,

    /// ESC features supported
    EscSupported = 8,

    /// Configured station address
    StaDr = 0x10,

    Alias = 0x12,
    DeviceLayerPort = 0x101,
    DeviceLayerAlias = 0x103,
    DeviceLayerStatus = 0x110,
    ApplicationLayerControl = 0x120,
    ApplicationLayerStatus = 0x130,
    InterruptMask = 0x200,
    ReceiveError = 0x300,

    FieldbusMemoryManagementUnit0 = 0x600,

    SyncManager0 = 0x800,
    SyncManager0Status = 0x805,
    SyncManager1Status = 0x808 + 5,

    DistributedClockTime0 = 0x900,
    DistributedClockSystemTime = 0x910,
    DistributedClockStartOfFrame = 0x918,
    DistributedClockSystemOffset = 0x920,
    DistributedClockSystemDelay = 0x928,
    DistributedClockSpeedCount = 0x930,
    DistributedClockTimeFilter = 0x934,
    DistributedClockControlUnit = 0x980,
    DistributedClockSynchronizationActive = 0x981,
    DistributedClockStart0 = 0x990,
    DistributedClockCycle0 = 0x9A0,
    DistributedClockCycle1 = 0x9A4,
}

impl From<EthercatRegister> for u16 {
    fn from(value: EthercatRegister) -> Self {
        value as u16
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorType {
    ServiceDataObjectError,
    Emergency,
    PacketError = 3,

    /// Application layer status error
    ApplicationLayerError,

    MailboxError,

    /// Mailbox received while the slot for its protocol was still full
    MailboxOverrun,

    /// Mailbox carrying the counter of the one before, dropped as a repeat
    MailboxRepeated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortError {
    Abort(u32),
    ErrorCode(u16),
    PacketError(PacketError),
    EmergencyError {
        error_code: u16,
        error_register: u8,
        byte1: u8,
        word1: u16,
        word2: u16,
    },
}

/// Struct to retrieve errors
#[derive(Debug, Clone, Copy)]
pub struct ErrorInfo {
    /// Time at which the error was generated
    pub time: SystemTime,

    /// Signal bit, error set but not read
    pub signal: bool,

    /// Slave number that generated the error
    pub slave: u16,

    /// CoE Service Data Object index that generated the error
    pub index: u16,

    /// CoE Service Data Object subindex that generated the error
    pub sub_index: u8,

    /// Type of error
    pub error_type: ErrorType,

    pub abort_error: AbortError,
}

pub const fn low_word(dword: u32) -> u16 {
    (dword & 0xFFFF) as u16
}

pub const fn high_word(dword: u32) -> u16 {
    (dword >> 16) as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn datagram_header_layout_is_little_endian() {
        let header = DatagramHeader {
            command: CommandType::LogicalReadWrite,
            index: 7,
            address_position: 0x0201,
            address_offset: 0x0403,
            data_length: 0x0005 | DATAGRAM_FOLLOWS,
            interrupt: 0,
        };
        let mut bytes = Vec::new();
        header.write_to(&mut bytes).unwrap();
        assert_eq!(bytes, [12, 7, 0x01, 0x02, 0x03, 0x04, 0x05, 0x80, 0, 0]);

        let decoded = DatagramHeader::read_from(&mut bytes.as_slice()).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(decoded.length(), 5);
        assert!(decoded.more_follows());
    }

    #[test]
    fn truncated_datagram_header_is_rejected() {
        let bytes = [4_u8, 0, 0];
        assert!(matches!(
            DatagramHeader::read_from(&mut bytes.as_slice()),
            Err(DatagramHeaderError::WrongSize(_))
        ));
    }

    #[test]
    fn ethernet_header_is_big_endian() {
        let header = EthernetHeader::new([0x0102, 0x0304, 0x0506]);
        let mut bytes = Vec::new();
        header.write_to(&mut bytes).unwrap();
        assert_eq!(bytes.len(), ETHERNET_HEADER_SIZE);
        assert_eq!(&bytes[..6], &[0xFF; 6]);
        assert_eq!(&bytes[6..12], &[1, 2, 3, 4, 5, 6]);
        assert_eq!(&bytes[12..], &[0x88, 0xA4]);
        assert_eq!(EthernetHeader::read_from(&mut bytes.as_slice()).unwrap(), header);
    }

    #[test]
    fn slave_state_error_flag_is_orthogonal() {
        let state = SlaveState::from_raw(0x14).unwrap();
        assert_eq!(state.state, EthercatState::SafeOperational);
        assert!(state.error);
        assert_eq!(state.to_raw(), 0x14);
        assert_eq!(SlaveState::new(EthercatState::Operational).to_raw(), 8);
        assert!(SlaveState::from_raw(0x05).is_err());
    }

    #[test]
    fn states_are_ordered() {
        assert!(EthercatState::None < EthercatState::Init);
        assert!(EthercatState::SafeOperational < EthercatState::Operational);
        assert!(EthercatState::Boot < EthercatState::SafeOperational);
    }
}
