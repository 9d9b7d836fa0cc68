//! Main EtherCAT functions.
//!
//! The [`Context`] owning the slave registry and group table, the frame index
//! stack for segmented process data, the error ring and the functions reading,
//! writing and checking the application layer state of slaves.

use std::{
    collections::HashMap,
    io::{self, Read, Write},
    sync::{
        atomic::{AtomicBool, AtomicI64, Ordering},
        Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
    },
    time::{Duration, SystemTime},
};

use heapless::{Deque, String as HeaplessString, Vec as HeaplessVec};
use log::{info, warn};

use crate::{
    osal::{usleep, OsalTimer},
    oshw::nicdrv::{Link, NicdrvError, Port},
};

use super::{
    base::{brd, bwr, fprd, fpwr},
    config::{DeviceSignature, SlaveConfigurator},
    mailbox::{MailboxBuffer, MailboxPool, MailboxQueue},
    r#type::{
        AbortError, CommandType, ErrorInfo, ErrorType, EthercatRegister, EthercatState, MailboxType,
        SlaveState, MAX_BUF_COUNT, TIMEOUT_RETURN, TIMEOUT_RET3,
    },
    ReadFrom, WriteTo,
};

/// Max. entries in EtherCAT error list
pub const MAX_E_LIST_ENTRIES: usize = 64;

/// Max length of readable name in slavelist
pub const MAX_NAME_LENGTH: usize = 40;

/// Maximum number of slaves in array
pub const MAX_SLAVES: usize = 200;

/// Maximum number of groups
pub const MAX_GROUPS: usize = 2;

/// Maximum number of IO segments per group
pub const MAX_IO_SEGMENTS: usize = 64;

/// Max mailbox size
pub const MAX_MAILBOX_SIZE: usize = 1486;

/// Number of buffers in the mailbox pool
pub const MAILBOX_POOL_SIZE: usize = 32;

/// Max Sync Manager used
pub const MAX_SM: usize = 8;

/// Max Fieldbus Memory Management Units used
pub const MAX_FMMU: usize = 4;

/// Size of the mailbox header in front of every mailbox
pub const MAILBOX_HEADER_SIZE: usize = 6;

#[derive(Debug, thiserror::Error)]
pub enum MainError {
    #[error(transparent)]
    Nicdrv(#[from] NicdrvError),

    /// Every mailbox buffer is leased
    #[error("mailbox buffer pool exhausted")]
    PoolExhausted,

    #[error("mailbox request queue full")]
    QueueFull,

    /// A buffer was returned to the pool twice
    #[error("mailbox buffer {0} is not leased")]
    MailboxNotLeased(usize),

    #[error("slave {0} does not exist")]
    InvalidSlave(u16),

    #[error("group {0} does not exist")]
    InvalidGroup(u8),

    #[error("slave {0} has no mailbox")]
    NoMailbox(u16),

    #[error("mailbox of slave {0} timed out")]
    MailboxTimeout(u16),

    #[error("mailbox transfer of slave {0} failed")]
    MailboxFailed(u16),

    #[error("invalid EtherCAT state {0:#04x}")]
    InvalidEthercatState(u8),

    #[error("invalid mailbox type {0}")]
    InvalidMailboxType(u8),

    /// Frame reply pulled out of order
    #[error("frame index {received} does not match outstanding index {expected}")]
    IndexMismatch { expected: u8, received: u8 },

    #[error("mailbox of {0} bytes does not fit the slave mailbox")]
    MailboxTooLarge(usize),

    #[error("malformed mailbox")]
    InvalidMailbox(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketError {
    UnexpectedFrameReturned = 1,
    DataContainerTooSmallForType = 3,
    TooManySyncManagers = 10,
}

/// Fieldbus Memory Management Unit
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Fmmu {
    pub log_start: u32,
    pub log_length: u16,
    pub log_start_bit: u8,
    pub log_end_bit: u8,
    pub physical_start: u16,
    pub physical_start_bit: u8,
    pub fmmu_type: u8,
    pub fmmu_active: u8,
}

impl Fmmu {
    pub const SIZE: usize = 16;

    /// FMMU reading from the slave (slave inputs)
    pub const TYPE_READ: u8 = 1;

    /// FMMU writing to the slave (slave outputs)
    pub const TYPE_WRITE: u8 = 2;
}

impl<R: Read> ReadFrom<R> for Fmmu {
    type Err = io::Error;

    fn read_from(reader: &mut R) -> Result<Self, Self::Err> {
        let bytes = <[u8; Self::SIZE]>::read_from(reader)?;
        Ok(Self {
            log_start: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            log_length: u16::from_le_bytes([bytes[4], bytes[5]]),
            log_start_bit: bytes[6],
            log_end_bit: bytes[7],
            physical_start: u16::from_le_bytes([bytes[8], bytes[9]]),
            physical_start_bit: bytes[10],
            fmmu_type: bytes[11],
            fmmu_active: bytes[12],
        })
    }
}

impl<W: Write> WriteTo<W> for Fmmu {
    fn write_to(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(&self.log_start.to_le_bytes())?;
        writer.write_all(&self.log_length.to_le_bytes())?;
        writer.write_all(&[self.log_start_bit, self.log_end_bit])?;
        writer.write_all(&self.physical_start.to_le_bytes())?;
        writer.write_all(&[self.physical_start_bit, self.fmmu_type, self.fmmu_active])?;
        writer.write_all(&[0; 3])
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncManager {
    pub start_address: u16,
    pub sm_length: u16,

    /// Control, status, activate and PDI control byte
    pub sm_flags: u32,
}

impl SyncManager {
    pub const SIZE: usize = 8;
}

/// Enable bit of the activate byte in the sync manager flags
pub const SYNC_MANAGER_ENABLE: u32 = 0x0001_0000;

impl<R: Read> ReadFrom<R> for SyncManager {
    type Err = io::Error;

    fn read_from(reader: &mut R) -> Result<Self, Self::Err> {
        let bytes = <[u8; Self::SIZE]>::read_from(reader)?;
        Ok(Self {
            start_address: u16::from_le_bytes([bytes[0], bytes[1]]),
            sm_length: u16::from_le_bytes([bytes[2], bytes[3]]),
            sm_flags: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        })
    }
}

impl<W: Write> WriteTo<W> for SyncManager {
    fn write_to(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(&self.start_address.to_le_bytes())?;
        writer.write_all(&self.sm_length.to_le_bytes())?;
        writer.write_all(&self.sm_flags.to_le_bytes())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SyncManagerType {
    #[default]
    Unused,
    MailboxWrite,
    MailboxRead,
    Outputs,
    Inputs,
}

/// Mailbox protocols a slave supports, bits of [`Slave::mailbox_protocols`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailboxProtocol {
    AdsOverEthercat = 1,
    EthernetOverEthercat = 2,
    CanopenOverEthercat = 4,
    FileOverEthercat = 8,
    ServoOverEthercat = 0x10,
    VendorOverEthercat = 0x20,
}

impl From<MailboxProtocol> for u16 {
    fn from(value: MailboxProtocol) -> Self {
        value as u16
    }
}

/// Standard ethercat mailbox header
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MailboxHeader {
    /// Length of the data following the header
    pub length: u16,
    pub address: u16,
    pub priority: u8,

    /// Mailbox type in the low nibble, counter in bits 4 to 6
    pub mailbox_type: u8,
}

impl MailboxHeader {
    pub const fn new(length: u16, mailbox_type: MailboxType, count: u8) -> Self {
        Self {
            length,
            address: 0,
            priority: 0,
            mailbox_type: mailbox_type as u8 | (count & 7) << 4,
        }
    }

    /// # Errors
    /// Returns an error if the type nibble is not a known mailbox type
    pub fn protocol(&self) -> Result<MailboxType, MainError> {
        MailboxType::try_from(self.mailbox_type & 0x0F)
    }

    pub const fn count(&self) -> u8 {
        (self.mailbox_type >> 4) & 7
    }
}

impl<R: Read> ReadFrom<R> for MailboxHeader {
    type Err = io::Error;

    fn read_from(reader: &mut R) -> Result<Self, Self::Err> {
        let value = <[u8; MAILBOX_HEADER_SIZE]>::read_from(reader)?;
        Ok(Self {
            length: u16::from_le_bytes([value[0], value[1]]),
            address: u16::from_le_bytes([value[2], value[3]]),
            priority: value[4] & 0x3F,
            mailbox_type: value[5],
        })
    }
}

impl<W: Write> WriteTo<W> for MailboxHeader {
    fn write_to(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(&self.length.to_le_bytes())?;
        writer.write_all(&self.address.to_le_bytes())?;
        writer.write_all(&[self.priority & 0x3F, self.mailbox_type])
    }
}

/// Cyclic mailbox handling of a slave
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MailboxHandlerState {
    /// Mailbox requests bypass the handler
    #[default]
    Inactive,

    /// Requests are queued and serviced by the cyclic handler
    Cyclic,

    /// Mailbox communication failed, no requests are serviced until recovered
    Lost,
}

/// Inbound mailboxes routed per protocol. A slot stays full until the client of
/// the protocol takes it.
#[derive(Debug, Default)]
pub struct MailboxInbox {
    slots: [Option<MailboxBuffer>; 6],

    /// Mailboxes dropped because the slot of their protocol was still full
    pub overrun: [u32; 6],
}

const fn inbox_slot(mailbox_type: MailboxType) -> Option<usize> {
    match mailbox_type {
        MailboxType::CanopenOverEthercat => Some(0),
        MailboxType::ServoOverEthercat => Some(1),
        MailboxType::FileOverEthercat => Some(2),
        MailboxType::EthernetOverEthercat => Some(3),
        MailboxType::VendorOverEthercat => Some(4),
        MailboxType::AdsOverEthercat => Some(5),
        MailboxType::Error => None,
    }
}

impl MailboxInbox {
    pub fn is_full(&self, mailbox_type: MailboxType) -> bool {
        inbox_slot(mailbox_type).is_some_and(|slot| self.slots[slot].is_some())
    }

    /// Store a received mailbox, handing it back if the slot is occupied
    ///
    /// # Errors
    /// Returns the buffer if the slot of the protocol is full
    pub fn store(
        &mut self,
        mailbox_type: MailboxType,
        buffer: MailboxBuffer,
    ) -> Result<(), MailboxBuffer> {
        match inbox_slot(mailbox_type) {
            Some(slot) if self.slots[slot].is_none() => {
                self.slots[slot] = Some(buffer);
                Ok(())
            }
            Some(slot) => {
                self.overrun[slot] = self.overrun[slot].saturating_add(1);
                Err(buffer)
            }
            None => Err(buffer),
        }
    }

    pub fn take(&mut self, mailbox_type: MailboxType) -> Option<MailboxBuffer> {
        inbox_slot(mailbox_type).and_then(|slot| self.slots[slot].take())
    }

    pub fn overrun(&self, mailbox_type: MailboxType) -> u32 {
        inbox_slot(mailbox_type).map_or(0, |slot| self.overrun[slot])
    }

    /// Count a failed transfer against `mailbox_type`
    pub fn count_overrun(&mut self, mailbox_type: MailboxType) {
        if let Some(slot) = inbox_slot(mailbox_type) {
            self.overrun[slot] = self.overrun[slot].saturating_add(1);
        }
    }

    pub fn drain(&mut self) -> impl Iterator<Item = MailboxBuffer> + '_ {
        self.slots.iter_mut().filter_map(Option::take)
    }
}

/// Bytes of one slave within the process image of a group
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IoView {
    pub group: u8,

    /// Byte offset in the io map of the group
    pub offset: usize,

    /// Bytes spanned, including a partially used first or last byte
    pub bytes: usize,

    /// Startbit in the first byte
    pub start_bit: u8,
}

/// Detected EtherCAT slave
#[derive(Debug, Default)]
pub struct Slave {
    /// State of slave
    pub state: SlaveState,

    /// Application layer status code
    pub al_status_code: u16,

    /// Configured address
    pub config_address: u16,

    /// Alias address
    pub alias_address: u16,

    pub manufacturer: u32,
    pub product: u32,
    pub revision: u32,
    pub serial: u32,

    /// ESC type register
    pub interface_type: u16,

    pub output_bits: u16,
    pub outputs: Option<IoView>,
    pub input_bits: u16,
    pub inputs: Option<IoView>,

    pub sync_manager: [SyncManager; MAX_SM],
    pub sync_manager_type: [SyncManagerType; MAX_SM],

    /// Fieldbus Memory Management Units
    pub fmmu: [Fmmu; MAX_FMMU],

    /// First unused Fieldbus Memory Management Unit
    pub fmmu_unused: u8,

    /// Length of write mailbox in bytes, 0 if no mailbox
    pub mailbox_length: u16,
    pub mailbox_write_offset: u16,

    /// Length of read mailbox in bytes
    pub mailbox_read_length: u16,
    pub mailbox_read_offset: u16,

    /// Supported mailbox protocols
    pub mailbox_protocols: u16,

    /// Counter value of mailbox link layer protocol 1..7
    pub mailbox_count: u8,

    pub mailbox_inbox: MailboxInbox,
    pub mailbox_handler_state: MailboxHandlerState,

    /// A queued mailbox request failed, cleared when the next one completes
    pub mailbox_degraded: bool,

    /// Counter of the last mailbox read from the slave, 0 before the first
    pub mailbox_read_count: u8,

    /// Has DC capability
    pub has_dc: bool,

    /// Topology: 1 to 3 links
    pub topology: u8,

    /// Active ports bitmap: ....3210, set if respective port is active
    pub active_ports: u8,

    /// Consumed ports bitmap: ...3210, used for internal delay measurement
    pub consumed_ports: u8,

    /// 0 = master
    pub parent: u16,

    /// Port number on parent this slave is connected to
    pub parent_port: u8,

    /// Port number on this slave the parent is connected to
    pub entry_port: u8,

    /// DC receive times of port 0 to 3
    pub dc_receive_times: [i32; 4],

    /// Propagation delay in nanoseconds
    pub propagation_delay: i32,

    /// Next DC slave, 0 if none
    pub dc_next: u16,

    /// Previous DC slave, 0 if none
    pub dc_previous: u16,

    /// DC cycle time in nanoseconds
    pub dc_cycle: u32,

    /// DC shift from clock modulus boundary
    pub dc_shift: i32,

    /// DC sync activation
    pub dc_active: bool,

    /// Block use of LRW in processdata
    pub block_logical_read_write: bool,

    pub group: u8,

    /// Whether the slave stopped responding
    pub is_lost: bool,

    pub name: HeaplessString<MAX_NAME_LENGTH>,
}

impl Slave {
    pub const fn signature(&self) -> DeviceSignature {
        DeviceSignature {
            manufacturer: self.manufacturer,
            product: self.product,
        }
    }

    pub const fn has_mailbox(&self) -> bool {
        self.mailbox_length > 0
    }
}

/// EtherCAT slave group
#[derive(Debug, Default)]
pub struct SlaveGroup {
    /// Logical start address for this group
    pub logical_start_address: u32,

    pub output_bytes: u32,
    pub input_bytes: u32,

    /// Inputs are read back at the logical addresses of the outputs
    pub overlapped: bool,

    /// Process image, outputs followed by inputs
    pub io_map: Mutex<Vec<u8>>,

    /// Has DC capability
    pub has_dc: bool,

    /// First DC slave of the group
    pub dc_next: u16,

    /// Block use of logical read write in process data
    pub block_logical_read_write: bool,

    /// IO segmentation list, datagrams must not break SM in two
    pub io_segments: HeaplessVec<u32, MAX_IO_SEGMENTS>,

    pub first_input_segment: usize,

    /// Offset of the inputs in the first input segment
    pub input_offset: u32,

    /// Expected workcounter outputs
    pub work_counter_outputs: u16,

    /// Expected workcounter inputs
    pub work_counter_inputs: u16,

    /// Request a state check of all slaves in the group
    pub check_slaves_states: AtomicBool,

    pub mailbox_queue: Mutex<MailboxQueue>,

    /// Read mailbox status bytes in the io map, owning slave and offset
    pub mailbox_status: Vec<(u16, usize)>,
}

impl SlaveGroup {
    /// Workcounter of a cycle in which every slave of the group responded
    pub const fn expected_work_counter(&self) -> u16 {
        self.work_counter_outputs * 2 + self.work_counter_inputs
    }

    pub fn io_map(&self) -> MutexGuard<'_, Vec<u8>> {
        lock(&self.io_map)
    }
}

/// Outstanding process data datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub index: u8,
    pub group: u8,
    pub command: CommandType,

    /// Where the input bytes of the reply go in the group io map
    pub io_offset: usize,

    /// Bytes of the reply data before its input bytes
    pub data_skip: usize,
    pub input_length: usize,

    /// Datagram data length
    pub length: usize,

    /// Offset of the data in the frame, the workcounter follows it
    pub frame_offset: usize,

    /// Offset of the data of the DC datagram, if the frame carries one
    pub dc_offset: Option<usize>,
}

/// Stack of the datagrams of segmented logical read, logical write and
/// logical read/write constructs, drained in reverse order of issue.
#[derive(Debug, Default)]
pub struct IndexStack {
    entries: HeaplessVec<IndexEntry, MAX_BUF_COUNT>,
}

impl IndexStack {
    /// # Errors
    /// Returns [`NicdrvError::ExhaustedIndices`] if the stack is full
    pub fn push(&mut self, entry: IndexEntry) -> Result<(), MainError> {
        self.entries
            .push(entry)
            .map_err(|_| NicdrvError::ExhaustedIndices.into())
    }

    /// Take the most recently pushed entry
    pub fn pull(&mut self) -> Option<IndexEntry> {
        self.entries.pop()
    }

    /// Take the most recently pushed entry, which must belong to `index`
    ///
    /// # Errors
    /// Returns an error if the stack is empty or its top belongs to another index
    pub fn release(&mut self, index: u8) -> Result<IndexEntry, MainError> {
        match self.entries.last() {
            Some(entry) if entry.index == index => self
                .entries
                .pop()
                .ok_or(NicdrvError::InvalidFrame.into()),
            Some(entry) => Err(MainError::IndexMismatch {
                expected: entry.index,
                received: index,
            }),
            None => Err(NicdrvError::InvalidFrame.into()),
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Ringbuffer for error storage, the oldest record is overwritten when full
#[derive(Debug, Default)]
pub struct ErrorRing {
    errors: Deque<ErrorInfo, MAX_E_LIST_ENTRIES>,
}

impl ErrorRing {
    pub fn push(&mut self, error: ErrorInfo) {
        if self.errors.is_full() {
            self.errors.pop_front();
        }
        let _ = self.errors.push_back(error);
    }

    pub fn pop(&mut self) -> Option<ErrorInfo> {
        self.errors.pop_front()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Terminal outcome of waiting for a state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateOutcome {
    Reached(SlaveState),

    /// Last observed state
    TimedOut(SlaveState),

    /// The slave flagged an error
    Errored { state: SlaveState, al_status_code: u16 },
}

impl StateOutcome {
    pub const fn state(&self) -> SlaveState {
        match *self {
            Self::Reached(state) | Self::TimedOut(state) | Self::Errored { state, .. } => state,
        }
    }

    pub const fn is_reached(&self) -> bool {
        matches!(self, Self::Reached(_))
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Context structure referenced by all EtherCAT functions
pub struct Context {
    pub port: Port,

    /// Slave 0 is the aggregate of all slaves
    slavelist: RwLock<Vec<Slave>>,

    /// Number of slaves found in configuration
    slave_count: u16,

    /// Maximum number of slaves allowed in slavelist
    pub max_slaves: u16,

    pub grouplist: Vec<SlaveGroup>,

    elist: Mutex<ErrorRing>,
    index_stack: Mutex<IndexStack>,
    mailbox_pool: Mutex<MailboxPool>,

    /// Set while the error list holds unread records
    ecaterror: AtomicBool,

    /// Last DC time from slaves
    dc_time: AtomicI64,

    configurators: HashMap<DeviceSignature, Box<dyn SlaveConfigurator>>,

    /// Flag to control legacy automatic state change or manual state change
    pub manual_state_change: bool,
}

impl Context {
    pub fn new(link: Box<dyn Link>) -> Self {
        Self::with_limits(link, MAX_SLAVES as u16, MAX_GROUPS as u8)
    }

    pub fn with_limits(link: Box<dyn Link>, max_slaves: u16, max_groups: u8) -> Self {
        Self {
            port: Port::new(link),
            slavelist: RwLock::new(vec![Slave::default()]),
            slave_count: 0,
            max_slaves,
            grouplist: (0..max_groups.max(1)).map(|_| SlaveGroup::default()).collect(),
            elist: Mutex::default(),
            index_stack: Mutex::default(),
            mailbox_pool: Mutex::new(MailboxPool::new()),
            ecaterror: AtomicBool::new(false),
            dc_time: AtomicI64::new(0),
            configurators: HashMap::new(),
            manual_state_change: false,
        }
    }

    pub const fn slave_count(&self) -> u16 {
        self.slave_count
    }

    /// Replace the slave list by `count` fresh slaves behind the aggregate
    pub(crate) fn reset_slaves(&mut self, count: u16) {
        self.slave_count = count;
        let slaves = self
            .slavelist
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        slaves.clear();
        slaves.resize_with(usize::from(count) + 1, Slave::default);
    }

    pub fn slaves(&self) -> RwLockReadGuard<'_, Vec<Slave>> {
        self.slavelist.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn slaves_mut(&self) -> RwLockWriteGuard<'_, Vec<Slave>> {
        self.slavelist.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// # Errors
    /// Returns [`MainError::InvalidSlave`] if the slave does not exist
    pub fn slave<T>(&self, slave: u16, f: impl FnOnce(&Slave) -> T) -> Result<T, MainError> {
        self.slaves()
            .get(usize::from(slave))
            .map(f)
            .ok_or(MainError::InvalidSlave(slave))
    }

    /// # Errors
    /// Returns [`MainError::InvalidSlave`] if the slave does not exist
    pub fn slave_mut<T>(&self, slave: u16, f: impl FnOnce(&mut Slave) -> T) -> Result<T, MainError> {
        self.slaves_mut()
            .get_mut(usize::from(slave))
            .map(f)
            .ok_or(MainError::InvalidSlave(slave))
    }

    /// # Errors
    /// Returns [`MainError::InvalidGroup`] if the group does not exist
    pub fn group(&self, group: u8) -> Result<&SlaveGroup, MainError> {
        self.grouplist
            .get(usize::from(group))
            .ok_or(MainError::InvalidGroup(group))
    }

    pub(crate) fn index_stack(&self) -> MutexGuard<'_, IndexStack> {
        lock(&self.index_stack)
    }

    pub fn mailbox_pool(&self) -> MutexGuard<'_, MailboxPool> {
        lock(&self.mailbox_pool)
    }

    /// Last DC time reported by the reference clock, in nanoseconds since 2000
    pub fn dc_time(&self) -> i64 {
        self.dc_time.load(Ordering::Acquire)
    }

    pub(crate) fn set_dc_time(&self, time: i64) {
        self.dc_time.store(time, Ordering::Release);
    }

    /// Use `configurator` for every slave with `signature` on its way from PREOP to SAFEOP
    pub fn register_configurator(
        &mut self,
        signature: DeviceSignature,
        configurator: Box<dyn SlaveConfigurator>,
    ) {
        self.configurators.insert(signature, configurator);
    }

    pub(crate) fn configurator(&self, signature: DeviceSignature) -> Option<&dyn SlaveConfigurator> {
        self.configurators
            .get(&signature)
            .map(|configurator| &**configurator)
    }

    /// Copy of the input bytes of a slave
    ///
    /// # Errors
    /// Returns an error if the slave or its group does not exist
    pub fn slave_inputs(&self, slave: u16) -> Result<Vec<u8>, MainError> {
        let Some(view) = self.slave(slave, |slave| slave.inputs)? else {
            return Ok(Vec::new());
        };
        let io_map = self.group(view.group)?.io_map();
        Ok(io_map
            .get(view.offset..view.offset + view.bytes)
            .map(<[u8]>::to_vec)
            .unwrap_or_default())
    }

    /// Overwrite the output bytes of a slave, `data` is truncated to its size
    ///
    /// # Errors
    /// Returns an error if the slave or its group does not exist
    pub fn set_slave_outputs(&self, slave: u16, data: &[u8]) -> Result<(), MainError> {
        let Some(view) = self.slave(slave, |slave| slave.outputs)? else {
            return Ok(());
        };
        let mut io_map = self.group(view.group)?.io_map();
        if let Some(outputs) = io_map.get_mut(view.offset..view.offset + view.bytes) {
            let length = outputs.len().min(data.len());
            outputs[..length].copy_from_slice(&data[..length]);
        }
        Ok(())
    }

    /// Clear the input bits of a slave so stale data is never presented
    ///
    /// # Errors
    /// Returns an error if the slave or its group does not exist
    pub fn zero_slave_inputs(&self, slave: u16) -> Result<(), MainError> {
        let Some((view, bits)) = self.slave(slave, |slave| slave.inputs.map(|view| (view, slave.input_bits)))? else {
            return Ok(());
        };
        let mut io_map = self.group(view.group)?.io_map();
        let Some(inputs) = io_map.get_mut(view.offset..view.offset + view.bytes) else {
            return Ok(());
        };
        if view.start_bit == 0 && usize::from(bits) % 8 == 0 {
            inputs.fill(0);
        } else {
            for bit in usize::from(view.start_bit)..usize::from(view.start_bit) + usize::from(bits) {
                inputs[bit / 8] &= !(1 << (bit % 8));
            }
        }
        Ok(())
    }
}

/// Increment the mailbox counter, cycling through 1..7
pub const fn next_mailbox_count(count: u8) -> u8 {
    if count >= 7 {
        1
    } else {
        count + 1
    }
}

/// Push an error record on the error list and raise the error flag
pub fn push_error(context: &Context, mut error: ErrorInfo) {
    error.signal = true;
    lock(&context.elist).push(error);
    context.ecaterror.store(true, Ordering::Release);
}

/// Pop the oldest error record, the error flag drops with the last record
pub fn pop_error(context: &Context) -> Option<ErrorInfo> {
    let mut elist = lock(&context.elist);
    let error = elist.pop();
    if elist.is_empty() {
        context.ecaterror.store(false, Ordering::Release);
    }
    error.map(|error| ErrorInfo {
        signal: false,
        ..error
    })
}

/// Check if the error list has entries
pub fn is_error(context: &Context) -> bool {
    context.ecaterror.load(Ordering::Acquire)
}

/// Report a packet error
pub fn packet_error(context: &Context, slave: u16, index: u16, sub_index: u8, error_code: PacketError) {
    push_error(
        context,
        ErrorInfo {
            time: SystemTime::now(),
            signal: true,
            slave,
            index,
            sub_index,
            error_type: ErrorType::PacketError,
            abort_error: AbortError::PacketError(error_code),
        },
    );
}

fn application_layer_error(context: &Context, slave: u16, al_status_code: u16) {
    push_error(
        context,
        ErrorInfo {
            time: SystemTime::now(),
            signal: true,
            slave,
            index: 0,
            sub_index: 0,
            error_type: ErrorType::ApplicationLayerError,
            abort_error: AbortError::ErrorCode(al_status_code),
        },
    );
}

/// Workcounter of a read, a frame that did not return counts as no answer
pub(crate) fn answered(result: Result<u16, NicdrvError>) -> Result<u16, MainError> {
    match result {
        Ok(wkc) => Ok(wkc),
        Err(NicdrvError::NoFrame) => Ok(0),
        Err(error) => Err(error.into()),
    }
}

fn read_slave_status(context: &Context, address: u16) -> Result<Option<(SlaveState, u16)>, MainError> {
    let mut status = [0; 6];
    let wkc = answered(fprd(
        &context.port,
        address,
        EthercatRegister::ApplicationLayerStatus.into(),
        &mut status,
        TIMEOUT_RETURN,
    ))?;
    if wkc == 0 {
        return Ok(None);
    }
    let state = SlaveState::from_raw(u16::from_le_bytes([status[0], status[1]]))
        .unwrap_or(SlaveState::NONE);
    Ok(Some((state, u16::from_le_bytes([status[4], status[5]]))))
}

/// Read the state of all slaves. Slaves that do not answer are in state NONE.
///
/// The state of slave 0 becomes the lowest state of all slaves, with the error
/// flag set if any slave flags an error.
///
/// # Errors
/// Returns an error if the link failed
pub fn readstate(context: &Context) -> Result<SlaveState, MainError> {
    let slave_count = context.slave_count();
    let mut raw = [0; 2];
    let wkc = answered(brd(
        &context.port,
        0,
        EthercatRegister::ApplicationLayerStatus.into(),
        &mut raw,
        TIMEOUT_RETURN,
    ))?;
    let bitwise = u16::from_le_bytes(raw);
    if wkc == slave_count && slave_count > 0 {
        // Broadcast reads OR the states, a single bit means all slaves agree
        if let Ok(state) = SlaveState::from_raw(bitwise) {
            if !state.error {
                let mut slaves = context.slaves_mut();
                for slave in slaves.iter_mut() {
                    slave.state = state;
                    slave.al_status_code = 0;
                }
                return Ok(state);
            }
        }
    }

    let mut lowest: Option<EthercatState> = None;
    let mut any_error = false;
    for slave in 1..=slave_count {
        let address = context.slave(slave, |slave| slave.config_address)?;
        let status = read_slave_status(context, address)?;
        let state = context.slave_mut(slave, |entry| {
            if let Some((state, code)) = status {
                entry.state = state;
                entry.al_status_code = code;
            } else {
                entry.state = SlaveState::NONE;
            }
            entry.state
        })?;
        any_error |= state.error;
        lowest = Some(lowest.map_or(state.state, |lowest| lowest.min(state.state)));
    }
    let aggregate = SlaveState {
        state: lowest.unwrap_or_default(),
        error: any_error,
    };
    context.slave_mut(0, |slave| slave.state = aggregate)?;
    Ok(aggregate)
}

/// Write the state stored for `slave`, slave 0 writes to all slaves.
///
/// Returns the workcounter, 0 if no slave acknowledged.
///
/// # Errors
/// Returns an error if the slave does not exist or the link failed
pub fn writestate(context: &Context, slave: u16) -> Result<u16, MainError> {
    let (address, state) =
        context.slave(slave, |entry| (entry.config_address, entry.state.to_raw()))?;
    let register = EthercatRegister::ApplicationLayerControl.into();
    let result = if slave == 0 {
        bwr(&context.port, 0, register, &state.to_le_bytes(), TIMEOUT_RET3)
    } else {
        fpwr(&context.port, address, register, &state.to_le_bytes(), TIMEOUT_RET3)
    };
    answered(result)
}

/// Request `target` from `slave` (0 for all slaves) without waiting for it.
///
/// # Errors
/// Returns an error if the slave does not exist or the link failed
pub fn request_state(context: &Context, slave: u16, target: SlaveState) -> Result<u16, MainError> {
    if slave == 0 {
        for entry in context.slaves_mut().iter_mut() {
            entry.state = target;
        }
    } else {
        context.slave_mut(slave, |entry| entry.state = target)?;
    }
    info!("slave {slave} requested to {:?}", target.state);
    writestate(context, slave)
}

/// Poll the state of `slave` (0 for all slaves) until it reached `target`,
/// flagged an error or `timeout` expired.
///
/// # Errors
/// Returns an error if the slave does not exist or the link failed
pub fn statecheck(
    context: &Context,
    slave: u16,
    target: EthercatState,
    timeout: Duration,
) -> Result<StateOutcome, MainError> {
    let address = context.slave(slave, |entry| entry.config_address)?;
    let timer = OsalTimer::new(timeout);
    loop {
        let observed = if slave == 0 {
            let mut raw = [0; 2];
            let wkc = answered(brd(
                &context.port,
                0,
                EthercatRegister::ApplicationLayerStatus.into(),
                &mut raw,
                TIMEOUT_RETURN,
            ))?;
            (wkc > 0).then(|| {
                (
                    SlaveState::from_raw(u16::from_le_bytes(raw)).unwrap_or(SlaveState::NONE),
                    0,
                )
            })
        } else {
            read_slave_status(context, address)?
        };
        let (state, al_status_code) = observed.unwrap_or((SlaveState::NONE, 0));
        context.slave_mut(slave, |entry| {
            entry.state = state;
            entry.al_status_code = al_status_code;
        })?;

        if state.state == target && !state.error {
            return Ok(StateOutcome::Reached(state));
        }
        if state.error {
            warn!("slave {slave} flags error in {:?}, AL status code {al_status_code:#06x}", state.state);
            application_layer_error(context, slave, al_status_code);
            return Ok(StateOutcome::Errored {
                state,
                al_status_code,
            });
        }
        if timer.is_expired() {
            return Ok(StateOutcome::TimedOut(state));
        }
        usleep(1000);
    }
}
