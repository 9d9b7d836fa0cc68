//! Configuration of the bus.
//!
//! Slave discovery, mapping of the process data of a group into its logical
//! image, and the reconfiguration and recovery of single slaves used by the
//! state monitor.

use std::time::Duration;

use heapless::Vec as HeaplessVec;
use log::{debug, info, warn};

use crate::oshw::nicdrv::NicdrvError;

use super::{
    base::{aprd, apwrw, brd, bwr, fprdw, fpwr, fpwrw},
    coe::CoEError,
    main::{
        answered, request_state, statecheck, Context, Fmmu, IoView, MailboxHandlerState, MainError, Slave,
        SlaveGroup, SyncManager, SyncManagerType, MAX_FMMU, MAX_IO_SEGMENTS, MAX_SM,
    },
    r#type::{
        EthercatRegister, EthercatState, SlaveState, FIRST_DC_DATAGRAM_SIZE, LOG_GROUP_OFFSET,
        MAX_LRW_DATA_LENGTH, STATE_ACK, TIMEOUT_RET3, TIMEOUT_RETURN, TIMEOUT_SAFE, TIMEOUT_STATE,
    },
    WriteTo,
};

pub const NODE_OFFSET: u16 = 0x1000;
pub const TEMP_NODE: u16 = 0xFFFF;

/// Standard SyncManager0 flags configuration for mailbox slaves
pub const DEFAULT_MAILBOX_SM0: u32 = 0x0001_0026;

/// Standard SyncManager1 flags configuration for mailbox slaves
pub const DEFAULT_MAILBOX_SM1: u32 = 0x0001_0022;

/// Buffered sync manager written by the master
pub const DEFAULT_OUTPUTS_SM: u32 = 0x0001_0064;

/// Buffered sync manager read by the master
pub const DEFAULT_INPUTS_SM: u32 = 0x0001_0020;

/// DC support bit of the ESC feature register
const ESC_SUPPORTS_DC: u16 = 0x04;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error(transparent)]
    Main(#[from] MainError),

    #[error(transparent)]
    CoE(#[from] CoEError),

    #[error("{found} slaves found, at most {max} supported")]
    SlaveCountExceeded { found: u16, max: u16 },

    #[error("slave {0} fails to respond")]
    SlaveFailsToRespond(u16),

    #[error("another slave found at the position of slave {0}")]
    FoundWrongSlave(u16),

    #[error("process data of group {0} needs more than {MAX_IO_SEGMENTS} segments")]
    TooManySegments(u8),
}

impl From<NicdrvError> for ConfigError {
    fn from(value: NicdrvError) -> Self {
        Self::Main(value.into())
    }
}

/// Identity a configuration strategy is registered for
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct DeviceSignature {
    pub manufacturer: u32,
    pub product: u32,
}

/// Configuration strategy for all slaves of one [`DeviceSignature`].
///
/// Runs while the slave is in PREOP, before its process data is mapped, so it
/// may change the sizes of the process data (for example by SDO writes to the
/// PDO assignment followed by updating `output_bits`/`input_bits`).
pub trait SlaveConfigurator: Send + Sync {
    /// # Errors
    /// Returns an error if the slave rejected its configuration
    fn configure(&self, context: &Context, slave: u16) -> Result<(), ConfigError>;
}

impl<F> SlaveConfigurator for F
where
    F: Fn(&Context, u16) -> Result<(), ConfigError> + Send + Sync,
{
    fn configure(&self, context: &Context, slave: u16) -> Result<(), ConfigError> {
        self(context, slave)
    }
}

/// Mailbox of a slave
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MailboxDescription {
    pub write_offset: u16,
    pub write_length: u16,
    pub read_offset: u16,
    pub read_length: u16,

    /// Bits of [`super::main::MailboxProtocol`]
    pub protocols: u16,
}

/// Sync manager carrying the process data of one direction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessDataDescription {
    pub start_address: u16,
    pub bits: u16,
}

/// What the SII of a slave tells the master
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlaveDescription {
    pub manufacturer: u32,
    pub product: u32,
    pub revision: u32,
    pub serial: u32,
    pub name: String,
    pub mailbox: Option<MailboxDescription>,
    pub outputs: Option<ProcessDataDescription>,
    pub inputs: Option<ProcessDataDescription>,

    /// Slave cannot handle LRW
    pub block_logical_read_write: bool,
}

/// Source of the SII information of discovered slaves
pub trait SiiSource {
    /// Description of the slave at `position`, `None` if there is none
    fn describe(&self, position: u16, slave: &Slave) -> Option<SlaveDescription>;
}

/// Descriptions listed in bus order, the first entry describes slave 1
impl SiiSource for [SlaveDescription] {
    fn describe(&self, position: u16, _slave: &Slave) -> Option<SlaveDescription> {
        self.get(usize::from(position).checked_sub(1)?).cloned()
    }
}

/// Resets the slavelist and grouplist.
fn init_context(context: &mut Context) {
    context.reset_slaves(0);
    let groups = context.grouplist.len();
    context.grouplist.clear();
    for group in 0..groups {
        context.grouplist.push(SlaveGroup {
            logical_start_address: (group as u32) << LOG_GROUP_OFFSET,
            ..Default::default()
        });
    }
    context.index_stack().clear();
}

/// Resets and detects slaves.
///
/// # Returns
/// The number of slaves detected or an error
fn detect_slaves(context: &Context) -> Result<u16, ConfigError> {
    let port = &context.port;

    // Ignore alias register
    bwr(port, 0, EthercatRegister::DeviceLayerAlias.into(), &[0], TIMEOUT_RET3)?;

    // Reset all slaves to initialization, twice for slaves that missed the first
    let reset = (EthercatState::Init as u16 | STATE_ACK).to_le_bytes();
    bwr(port, 0, EthercatRegister::ApplicationLayerControl.into(), &reset, TIMEOUT_RET3)?;
    bwr(port, 0, EthercatRegister::ApplicationLayerControl.into(), &reset, TIMEOUT_RET3)?;

    // Detect number of slaves
    let mut word = [0; 2];
    let wkc = answered(brd(port, 0, EthercatRegister::Type.into(), &mut word, TIMEOUT_SAFE))?;
    if wkc >= context.max_slaves {
        warn!("{wkc} slaves found, more than the maximum of {}", context.max_slaves);
        return Err(ConfigError::SlaveCountExceeded {
            found: wkc,
            max: context.max_slaves,
        });
    }
    Ok(wkc)
}

/// Clear the registers the master configures on every slave
fn set_slaves_to_default(context: &Context) -> Result<(), ConfigError> {
    let port = &context.port;
    let write = |register: EthercatRegister, data: &[u8]| {
        bwr(port, 0, register.into(), data, TIMEOUT_RET3)
    };

    // Deactivate loop manual
    write(EthercatRegister::DeviceLayerPort, &[0])?;

    // Set interrupt mask
    write(EthercatRegister::InterruptMask, &4_u16.to_le_bytes())?;

    // Reset CRC counters
    write(EthercatRegister::ReceiveError, &[0; 8])?;

    // Reset FMMUs and sync managers
    write(EthercatRegister::FieldbusMemoryManagementUnit0, &[0; 16 * 3])?;
    write(EthercatRegister::SyncManager0, &[0; 8 * 4])?;

    // Reset activation register, system time and DC speedstart
    write(EthercatRegister::DistributedClockSynchronizationActive, &[0])?;
    write(EthercatRegister::DistributedClockSystemTime, &[0; 4])?;
    write(EthercatRegister::DistributedClockSpeedCount, &0x1000_u16.to_le_bytes())?;

    // DC filter expression
    write(EthercatRegister::DistributedClockTimeFilter, &0x0C00_u16.to_le_bytes())?;

    // Ignore alias register
    write(EthercatRegister::DeviceLayerAlias, &[0])?;

    // Reset all slaves to initialization
    write(
        EthercatRegister::ApplicationLayerControl,
        &(EthercatState::Init as u16 | STATE_ACK).to_le_bytes(),
    )?;
    Ok(())
}

/// Topology and active ports from the DL status register.
///
/// A port counts when its link is up and its loop is open.
pub const fn port_topology(dl_status: u16) -> (u8, u8) {
    let mut topology = 0;
    let mut active_ports = 0;
    let mut port = 0;
    while port < 4 {
        if (dl_status >> (8 + port * 2)) & 3 == 2 {
            topology += 1;
            active_ports |= 1 << port;
        }
        port += 1;
    }
    (topology, active_ports)
}

/// Find the parent of `slave` from the topologies of the slaves before it.
///
/// `topologies[n]` belongs to slave `n`, entry 0 is unused.
pub fn find_parent(topologies: &[u8], slave: u16) -> u16 {
    if slave <= 1 {
        return 0;
    }
    let mut branches: i32 = 0;
    let mut candidate = slave - 1;
    loop {
        let topology = topologies.get(usize::from(candidate)).copied().unwrap_or(2);
        match topology {
            // Endpoint
            1 => branches -= 1,
            // Split
            3 => branches += 1,
            // Cross
            4 => branches += 2,
            _ => {}
        }
        if (branches >= 0 && topology > 1) || candidate == 1 {
            return candidate;
        }
        candidate -= 1;
    }
}

fn encode<T: WriteTo<Vec<u8>>>(value: &T, size: usize) -> Result<Vec<u8>, MainError> {
    let mut bytes = Vec::with_capacity(size);
    value.write_to(&mut bytes)?;
    Ok(bytes)
}

/// Copy a slave description into the registry
fn apply_description(slave: &mut Slave, description: SlaveDescription) {
    slave.manufacturer = description.manufacturer;
    slave.product = description.product;
    slave.revision = description.revision;
    slave.serial = description.serial;
    slave.name.clear();
    for character in description.name.chars() {
        if slave.name.push(character).is_err() {
            break;
        }
    }
    slave.block_logical_read_write = description.block_logical_read_write;

    let mut next_sm = 0;
    if let Some(mailbox) = description.mailbox {
        slave.mailbox_write_offset = mailbox.write_offset;
        slave.mailbox_length = mailbox.write_length;
        slave.mailbox_read_offset = mailbox.read_offset;
        slave.mailbox_read_length = mailbox.read_length;
        slave.mailbox_protocols = mailbox.protocols;
        slave.sync_manager[0] = SyncManager {
            start_address: mailbox.write_offset,
            sm_length: mailbox.write_length,
            sm_flags: DEFAULT_MAILBOX_SM0,
        };
        slave.sync_manager[1] = SyncManager {
            start_address: mailbox.read_offset,
            sm_length: mailbox.read_length,
            sm_flags: DEFAULT_MAILBOX_SM1,
        };
        slave.sync_manager_type[0] = SyncManagerType::MailboxWrite;
        slave.sync_manager_type[1] = SyncManagerType::MailboxRead;
        next_sm = 2;
    }

    let directions = [
        (description.outputs, SyncManagerType::Outputs, DEFAULT_OUTPUTS_SM),
        (description.inputs, SyncManagerType::Inputs, DEFAULT_INPUTS_SM),
    ];
    for (process_data, sm_type, sm_flags) in directions {
        let Some(process_data) = process_data.filter(|process_data| process_data.bits > 0) else {
            continue;
        };
        if sm_type == SyncManagerType::Outputs {
            slave.output_bits = process_data.bits;
        } else {
            slave.input_bits = process_data.bits;
        }
        slave.sync_manager[next_sm] = SyncManager {
            start_address: process_data.start_address,
            sm_length: process_data.bits.div_ceil(8),
            sm_flags,
        };
        slave.sync_manager_type[next_sm] = sm_type;
        next_sm += 1;
    }
}

/// Enumerate and init all slaves.
///
/// Every slave gets the configured address `NODE_OFFSET + position`, its
/// alias, ESC type, port state and DC capability are read, and `sii` tells the
/// identity, mailbox and process data layout. Mailbox sync managers are
/// programmed and, unless `manual_state_change` is set, PREOP is requested.
///
/// # Returns
/// Number of slaves found
///
/// # Errors
/// Returns an error if more slaves than `max_slaves` were found or the link failed
pub fn config_init<S: SiiSource + ?Sized>(context: &mut Context, sii: &S) -> Result<u16, ConfigError> {
    debug!("config_init");
    init_context(context);
    let slave_count = detect_slaves(context)?;
    if slave_count == 0 {
        info!("no slaves found");
        return Ok(0);
    }
    set_slaves_to_default(context)?;
    context.reset_slaves(slave_count);

    let port = &context.port;
    let mut topologies = vec![0; usize::from(slave_count) + 1];
    for slave in 1..=slave_count {
        let address = NODE_OFFSET + slave;

        // Auto increment address of the slave at this position
        let position = 1_u16.wrapping_sub(slave);
        apwrw(port, position, EthercatRegister::StaDr.into(), address, TIMEOUT_RET3)?;

        let alias = fprdw(port, address, EthercatRegister::Alias.into(), TIMEOUT_RET3)?;
        let interface_type = fprdw(port, address, EthercatRegister::Type.into(), TIMEOUT_RET3)?;
        let dl_status = fprdw(port, address, EthercatRegister::DeviceLayerStatus.into(), TIMEOUT_RET3)?;
        let features = fprdw(port, address, EthercatRegister::EscSupported.into(), TIMEOUT_RET3)?;

        let (topology, active_ports) = port_topology(dl_status);
        topologies[usize::from(slave)] = topology;
        let parent = find_parent(&topologies, slave);

        let mut slaves = context.slaves_mut();
        let entry = &mut slaves[usize::from(slave)];
        entry.config_address = address;
        entry.alias_address = alias;
        entry.interface_type = interface_type;
        entry.topology = topology;
        entry.active_ports = active_ports;
        entry.consumed_ports = active_ports;
        entry.parent = parent;
        entry.has_dc = features & ESC_SUPPORTS_DC != 0;
        entry.state = SlaveState::new(EthercatState::Init);
        if let Some(description) = sii.describe(slave, entry) {
            apply_description(entry, description);
        }
        debug!(
            "slave {slave} address {address:#06x} alias {alias} topology {topology} parent {parent}{}",
            if entry.has_dc { " DC" } else { "" }
        );
    }

    let outcome = statecheck(context, 0, EthercatState::Init, TIMEOUT_STATE)?;
    if !outcome.is_reached() {
        warn!("not all slaves reached INIT, lowest state {:?}", outcome.state().state);
    }

    for slave in 1..=slave_count {
        let (address, has_mailbox, mailbox_sync_managers) = context.slave(slave, |entry| {
            (entry.config_address, entry.has_mailbox(), [entry.sync_manager[0], entry.sync_manager[1]])
        })?;
        if has_mailbox {
            for (index, sync_manager) in mailbox_sync_managers.iter().enumerate() {
                write_sync_manager(context, address, index, sync_manager, TIMEOUT_RET3)?;
            }
        }
        if !context.manual_state_change {
            request_state(
                context,
                slave,
                SlaveState::new(EthercatState::PreOperational),
            )?;
        }
    }
    info!("{slave_count} slaves found and configured");
    Ok(slave_count)
}

fn write_sync_manager(
    context: &Context,
    address: u16,
    index: usize,
    sync_manager: &SyncManager,
    timeout: Duration,
) -> Result<u16, ConfigError> {
    let register = u16::from(EthercatRegister::SyncManager0) + (index * SyncManager::SIZE) as u16;
    let bytes = encode(sync_manager, SyncManager::SIZE)?;
    Ok(fpwr(&context.port, address, register, &bytes, timeout)?)
}

fn write_fmmu(context: &Context, address: u16, index: usize, fmmu: &Fmmu, timeout: Duration) -> Result<u16, ConfigError> {
    let register =
        u16::from(EthercatRegister::FieldbusMemoryManagementUnit0) + (index * Fmmu::SIZE) as u16;
    let bytes = encode(fmmu, Fmmu::SIZE)?;
    Ok(fpwr(&context.port, address, register, &bytes, timeout)?)
}

/// Where the process data of one slave lands in the logical image
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Placement {
    /// Byte offset from the start of the image
    byte: usize,
    start_bit: u8,
    bytes: usize,
}

/// Lays out process data bit by bit, closing an IO segment whenever the next
/// slave would push it over the datagram limit.
#[derive(Debug)]
struct ImageBuilder {
    bit_position: usize,
    segments: HeaplessVec<u32, MAX_IO_SEGMENTS>,
    segment_start: usize,
    segment_limit: usize,
    overflow: bool,
}

impl ImageBuilder {
    fn new(first_segment_limit: usize) -> Self {
        Self {
            bit_position: 0,
            segments: HeaplessVec::new(),
            segment_start: 0,
            segment_limit: first_segment_limit,
            overflow: false,
        }
    }

    const fn byte_position(&self) -> usize {
        self.bit_position.div_ceil(8)
    }

    fn align(&mut self) {
        self.bit_position = self.byte_position() * 8;
    }

    /// Place `bits`, sharing the current byte when they fit in its remaining bits
    fn place(&mut self, bits: u16) -> Placement {
        let bits = usize::from(bits);
        if !(bits < 8 && self.bit_position % 8 + bits <= 8) {
            self.align();
        }
        let start = self.bit_position;
        self.bit_position += bits;
        let byte = start / 8;
        let end = self.byte_position();
        if end - self.segment_start > self.segment_limit && byte > self.segment_start {
            self.close_segment(byte);
        }
        Placement {
            byte,
            start_bit: (start % 8) as u8,
            bytes: end - byte,
        }
    }

    /// Place a slave of an overlapped image, always starting on a byte
    fn place_overlapped(&mut self, bytes: usize) -> usize {
        self.align();
        let byte = self.byte_position();
        self.bit_position += bytes * 8;
        if byte + bytes - self.segment_start > self.segment_limit && byte > self.segment_start {
            self.close_segment(byte);
        }
        byte
    }

    fn close_segment(&mut self, at: usize) {
        if self.segments.push((at - self.segment_start) as u32).is_err() {
            self.overflow = true;
        }
        self.segment_start = at;
        self.segment_limit = MAX_LRW_DATA_LENGTH;
    }

    /// Segment index and offset of the byte the next placement starts at
    fn cursor(&self) -> (usize, u32) {
        (
            self.segments.len(),
            (self.byte_position() - self.segment_start) as u32,
        )
    }

    fn finish(mut self) -> Option<(HeaplessVec<u32, MAX_IO_SEGMENTS>, usize)> {
        let length = self.byte_position();
        if length > self.segment_start {
            self.close_segment(length);
        }
        (!self.overflow).then_some((self.segments, length))
    }
}

/// Programming of one slave resulting from the mapping of its group
#[derive(Debug, Default)]
struct SlaveMapping {
    slave: u16,
    outputs: Option<(Placement, u16)>,
    inputs: Option<(Placement, u16)>,

    /// Segment holding the inputs
    input_segment: usize,

    /// Byte for the read mailbox status of a cyclic mailbox slave
    mailbox_status: Option<Placement>,
}

/// Attach the read mailbox status byte placed last to a slave. Returns the
/// workcounter the byte adds, a slave reading inputs in the same segment
/// counts once.
fn map_mailbox_status(mapping: &mut SlaveMapping, placement: Placement, builder: &ImageBuilder) -> u16 {
    mapping.mailbox_status = Some(placement);
    let shares_datagram = mapping.inputs.is_some() && mapping.input_segment == builder.segments.len();
    u16::from(!shares_datagram)
}

fn group_members(context: &Context, group: u8) -> Vec<u16> {
    context
        .slaves()
        .iter()
        .enumerate()
        .skip(1)
        .filter(|(_, slave)| group == 0 || slave.group == group)
        .map(|(slave, _)| slave as u16)
        .collect()
}

/// Run the registered configuration strategy of every slave of the group
fn run_configurators(context: &Context, members: &[u16]) -> Result<(), ConfigError> {
    for &slave in members {
        let signature = context.slave(slave, Slave::signature)?;
        if let Some(configurator) = context.configurator(signature) {
            // Strategies reach the slave through its mailbox, available from PREOP
            let outcome = statecheck(context, slave, EthercatState::PreOperational, TIMEOUT_STATE)?;
            if !outcome.is_reached() {
                warn!("slave {slave} not in PREOP for its configuration strategy: {:?}", outcome.state());
            }
            debug!("slave {slave} configuration strategy for {signature:?}");
            configurator.configure(context, slave)?;
        }
    }
    Ok(())
}

/// Program sync managers and FMMUs of a mapped slave and store its views
fn program_slave(
    context: &Context,
    group: u8,
    logical_start: u32,
    mapping: &SlaveMapping,
    input_base: usize,
) -> Result<(), ConfigError> {
    let slave = mapping.slave;
    let (address, mut sync_managers, sync_manager_types) = context.slave(slave, |entry| {
        (entry.config_address, entry.sync_manager, entry.sync_manager_type)
    })?;

    let mut fmmus = [Fmmu::default(); MAX_FMMU];
    let mut fmmu_count = 0;
    let directions = [
        (mapping.outputs, SyncManagerType::Outputs, Fmmu::TYPE_WRITE),
        (mapping.inputs, SyncManagerType::Inputs, Fmmu::TYPE_READ),
    ];
    for (placement, sm_type, fmmu_type) in directions {
        let Some((placement, bits)) = placement else {
            continue;
        };
        let Some(sm) = sync_manager_types.iter().position(|&candidate| candidate == sm_type) else {
            warn!("slave {slave} has process data but no {sm_type:?} sync manager");
            continue;
        };
        sync_managers[sm].sm_length = bits.div_ceil(8);
        write_sync_manager(context, address, sm, &sync_managers[sm], TIMEOUT_RET3)?;

        let end_bit = (usize::from(placement.start_bit) + usize::from(bits) - 1) % 8;
        fmmus[fmmu_count] = Fmmu {
            log_start: logical_start + placement.byte as u32,
            log_length: placement.bytes as u16,
            log_start_bit: placement.start_bit,
            log_end_bit: end_bit as u8,
            physical_start: sync_managers[sm].start_address,
            physical_start_bit: 0,
            fmmu_type,
            fmmu_active: 1,
        };
        write_fmmu(context, address, fmmu_count, &fmmus[fmmu_count], TIMEOUT_RET3)?;
        fmmu_count += 1;
    }

    if let Some(placement) = mapping.mailbox_status {
        fmmus[fmmu_count] = Fmmu {
            log_start: logical_start + placement.byte as u32,
            log_length: 1,
            log_start_bit: 0,
            log_end_bit: 7,
            physical_start: EthercatRegister::SyncManager1Status.into(),
            physical_start_bit: 0,
            fmmu_type: Fmmu::TYPE_READ,
            fmmu_active: 1,
        };
        write_fmmu(context, address, fmmu_count, &fmmus[fmmu_count], TIMEOUT_RET3)?;
        fmmu_count += 1;
    }

    context.slave_mut(slave, |entry| {
        entry.sync_manager = sync_managers;
        entry.fmmu = fmmus;
        entry.fmmu_unused = fmmu_count as u8;
        entry.outputs = mapping.outputs.map(|(placement, _)| IoView {
            group,
            offset: placement.byte,
            bytes: placement.bytes,
            start_bit: placement.start_bit,
        });
        entry.inputs = mapping.inputs.map(|(placement, _)| IoView {
            group,
            offset: input_base + placement.byte,
            bytes: placement.bytes,
            start_bit: placement.start_bit,
        });
    })?;
    Ok(())
}

/// Request SAFEOP for every mapped slave unless states are changed manually
fn request_safe_operational(context: &Context, members: &[u16]) -> Result<(), ConfigError> {
    if context.manual_state_change {
        return Ok(());
    }
    for &slave in members {
        request_state(context, slave, SlaveState::new(EthercatState::SafeOperational))?;
    }
    Ok(())
}

fn map_group(context: &mut Context, group: u8, overlapped: bool) -> Result<usize, ConfigError> {
    let logical_start = context.group(group)?.logical_start_address;
    let members = group_members(context, group);
    run_configurators(context, &members)?;

    let (bits, mailbox_cyclic, any_dc, block_lrw): (Vec<(u16, u16)>, Vec<bool>, bool, bool) = {
        let slaves = context.slaves();
        let bits = members
            .iter()
            .map(|&slave| {
                let entry = &slaves[usize::from(slave)];
                (entry.output_bits, entry.input_bits)
            })
            .collect();
        let mailbox_cyclic = members
            .iter()
            .map(|&slave| {
                let entry = &slaves[usize::from(slave)];
                entry.has_mailbox() && entry.mailbox_handler_state == MailboxHandlerState::Cyclic
            })
            .collect();
        let any_dc = members.iter().any(|&slave| slaves[usize::from(slave)].has_dc);
        let block_lrw = members
            .iter()
            .any(|&slave| slaves[usize::from(slave)].block_logical_read_write);
        (bits, mailbox_cyclic, any_dc, block_lrw)
    };

    // The first frame of a DC group also carries the reference clock datagram
    let first_limit = if any_dc {
        MAX_LRW_DATA_LENGTH - FIRST_DC_DATAGRAM_SIZE
    } else {
        MAX_LRW_DATA_LENGTH
    };
    let mut builder = ImageBuilder::new(first_limit);
    let mut mappings: Vec<SlaveMapping> = members
        .iter()
        .map(|&slave| SlaveMapping {
            slave,
            ..SlaveMapping::default()
        })
        .collect();
    let mut outputs_wkc = 0;
    let mut inputs_wkc = 0;

    let (output_bytes, input_bytes, first_input_segment, input_offset) = if overlapped {
        for (mapping, &(output_bits, input_bits)) in mappings.iter_mut().zip(&bits) {
            let bytes = usize::from(output_bits.max(input_bits)).div_ceil(8);
            if bytes == 0 {
                continue;
            }
            let byte = builder.place_overlapped(bytes);
            mapping.input_segment = builder.segments.len();
            if output_bits > 0 {
                let bytes = usize::from(output_bits).div_ceil(8);
                mapping.outputs = Some((Placement { byte, start_bit: 0, bytes }, output_bits));
                outputs_wkc += 1;
            }
            if input_bits > 0 {
                let bytes = usize::from(input_bits).div_ceil(8);
                mapping.inputs = Some((Placement { byte, start_bit: 0, bytes }, input_bits));
                inputs_wkc += 1;
            }
        }
        for (mapping, &cyclic) in mappings.iter_mut().zip(&mailbox_cyclic) {
            if cyclic {
                let byte = builder.place_overlapped(1);
                inputs_wkc += map_mailbox_status(mapping, Placement { byte, start_bit: 0, bytes: 1 }, &builder);
            }
        }
        let length = builder.byte_position();
        (length, length, 0, 0)
    } else {
        for (mapping, &(output_bits, _)) in mappings.iter_mut().zip(&bits) {
            if output_bits > 0 {
                mapping.outputs = Some((builder.place(output_bits), output_bits));
                outputs_wkc += 1;
            }
        }
        builder.align();
        let output_bytes = builder.byte_position();
        let (first_input_segment, input_offset) = builder.cursor();
        for (mapping, &(_, input_bits)) in mappings.iter_mut().zip(&bits) {
            if input_bits > 0 {
                mapping.inputs = Some((builder.place(input_bits), input_bits));
                mapping.input_segment = builder.segments.len();
                inputs_wkc += 1;
            }
        }
        for (mapping, &cyclic) in mappings.iter_mut().zip(&mailbox_cyclic) {
            if cyclic {
                let placement = builder.place(8);
                inputs_wkc += map_mailbox_status(mapping, placement, &builder);
            }
        }
        let input_bytes = builder.byte_position() - output_bytes;
        (output_bytes, input_bytes, first_input_segment, input_offset)
    };
    let (io_segments, _) = builder.finish().ok_or(ConfigError::TooManySegments(group))?;

    // In an overlapped image the inputs are stored behind all outputs
    let input_base = if overlapped { output_bytes } else { 0 };
    for mapping in &mappings {
        program_slave(context, group, logical_start, mapping, input_base)?;
    }
    request_safe_operational(context, &members)?;

    let io_map_size = output_bytes + input_bytes;
    let entry = context
        .grouplist
        .get_mut(usize::from(group))
        .ok_or(MainError::InvalidGroup(group))?;
    entry.output_bytes = output_bytes as u32;
    entry.input_bytes = input_bytes as u32;
    entry.overlapped = overlapped;
    entry.block_logical_read_write = block_lrw;
    entry.io_segments = io_segments;
    entry.first_input_segment = first_input_segment;
    entry.input_offset = input_offset;
    entry.work_counter_outputs = outputs_wkc;
    entry.work_counter_inputs = inputs_wkc;
    entry.mailbox_status = mappings
        .iter()
        .filter_map(|mapping| mapping.mailbox_status.map(|placement| (mapping.slave, input_base + placement.byte)))
        .collect();
    *entry.io_map() = vec![0; io_map_size];

    info!(
        "group {group} mapped: {output_bytes} output bytes, {input_bytes} input bytes, {} segments, expected workcounter {}",
        entry.io_segments.len(),
        entry.expected_work_counter()
    );
    Ok(io_map_size)
}

/// Map all slaves of `group` (0 for all slaves) into the process image of the
/// group. Outputs come first, followed by the inputs; slaves with less than a
/// byte of process data share bytes. Slaves already switched to cyclic mailbox
/// handling get their read mailbox status mapped behind the inputs.
///
/// # Returns
/// Size of the io map of the group
///
/// # Errors
/// Returns an error if a configuration strategy failed, the image needs too many
/// segments or the link failed
pub fn config_map_group(context: &mut Context, group: u8) -> Result<usize, ConfigError> {
    debug!("config_map_group {group}");
    map_group(context, group, false)
}

/// Map all slaves of `group` with inputs and outputs of a slave sharing their
/// logical addresses, so a single LRW returns the inputs in place of the outputs.
///
/// The io map holds all outputs followed by all inputs, both parts being as
/// long as the logical image.
///
/// # Errors
/// Returns an error if a configuration strategy failed, the image needs too many
/// segments or the link failed
pub fn config_overlap_map_group(context: &mut Context, group: u8) -> Result<usize, ConfigError> {
    debug!("config_overlap_map_group {group}");
    map_group(context, group, true)
}

/// Reconfigure a slave from INIT back to SAFEOP.
///
/// # Parameters
/// - `context`: Context struct
/// - `slave`: Slave number
/// - `timeout`: Timeout of the individual writes
///
/// # Returns
/// State of the slave after the attempt
///
/// # Errors
/// Returns an error if the configuration strategy failed or the link failed
pub fn reconfig_slave(context: &Context, slave: u16, timeout: Duration) -> Result<SlaveState, ConfigError> {
    let (address, sync_managers, fmmus, fmmu_unused) = context.slave(slave, |entry| {
        (entry.config_address, entry.sync_manager, entry.fmmu, entry.fmmu_unused)
    })?;
    let port = &context.port;
    let control = EthercatRegister::ApplicationLayerControl.into();

    if answered(fpwrw(port, address, control, EthercatState::Init as u16, timeout))? == 0 {
        return Ok(SlaveState::NONE);
    }
    let mut outcome = statecheck(context, slave, EthercatState::Init, TIMEOUT_STATE)?;
    if !outcome.is_reached() {
        return Ok(outcome.state());
    }
    // INIT restarts the mailbox counter of the slave
    context.slave_mut(slave, |entry| entry.mailbox_read_count = 0)?;

    // Program all enabled sync managers
    for (index, sync_manager) in sync_managers.iter().enumerate().take(MAX_SM) {
        if sync_manager.start_address != 0 {
            write_sync_manager(context, address, index, sync_manager, timeout)?;
        }
    }

    fpwrw(port, address, control, EthercatState::PreOperational as u16, timeout)?;
    outcome = statecheck(context, slave, EthercatState::PreOperational, TIMEOUT_STATE)?;
    if outcome.is_reached() {
        let signature = context.slave(slave, Slave::signature)?;
        if let Some(configurator) = context.configurator(signature) {
            configurator.configure(context, slave)?;
        }

        fpwrw(port, address, control, EthercatState::SafeOperational as u16, timeout)?;
        outcome = statecheck(context, slave, EthercatState::SafeOperational, TIMEOUT_STATE)?;

        // Program configured FMMUs
        for (index, fmmu) in fmmus.iter().enumerate().take(usize::from(fmmu_unused)) {
            write_fmmu(context, address, index, fmmu, timeout)?;
        }
    }
    debug!("slave {slave} reconfigured to {:?}", outcome.state().state);
    Ok(outcome.state())
}

/// Recover a slave that lost its configured address.
///
/// The slave found at the position of `slave` gets its configured address
/// back if its alias and ESC type match.
///
/// # Errors
/// Returns [`ConfigError::SlaveFailsToRespond`] if no slave answers at the
/// position and [`ConfigError::FoundWrongSlave`] if another slave is found
pub fn recover_slave(context: &Context, slave: u16, timeout: Duration) -> Result<(), ConfigError> {
    let (config_address, alias, interface_type) = context.slave(slave, |entry| {
        (entry.config_address, entry.alias_address, entry.interface_type)
    })?;
    let port = &context.port;
    let station_address = EthercatRegister::StaDr.into();
    let position = 1_u16.wrapping_sub(slave);

    // A position without a slave leaves the marker in place
    let mut read = 0xFFFE_u16.to_le_bytes();
    answered(aprd(port, position, station_address, &mut read, timeout))?;
    let read_address = u16::from_le_bytes(read);

    // Correct slave found, finished
    if read_address == config_address {
        return Ok(());
    }

    // Only slaves that lost their address qualify
    if read_address == 0xFFFE {
        return Err(ConfigError::SlaveFailsToRespond(slave));
    }
    if read_address != 0 {
        return Err(ConfigError::FoundWrongSlave(slave));
    }

    // Clear possible slaves at TEMP_NODE
    answered(fpwrw(port, TEMP_NODE, station_address, 0, TIMEOUT_RETURN))?;

    // Set temporary node address of slave
    if answered(apwrw(port, position, station_address, TEMP_NODE, timeout))? == 0 {
        answered(fpwrw(port, TEMP_NODE, station_address, 0, TIMEOUT_RETURN))?;
        return Err(ConfigError::SlaveFailsToRespond(slave));
    }

    let found_alias = fprdw(port, TEMP_NODE, EthercatRegister::Alias.into(), timeout)?;
    let found_type = fprdw(port, TEMP_NODE, EthercatRegister::Type.into(), timeout)?;
    if found_alias == alias && found_type == interface_type {
        // Set the configured address of the slave
        fpwrw(port, TEMP_NODE, station_address, config_address, timeout)?;
        info!("slave {slave} recovered at address {config_address:#06x}");
        Ok(())
    } else {
        // Slave is not the expected one, remove the configured address
        fpwrw(port, TEMP_NODE, station_address, 0, timeout)?;
        warn!("slave {slave} position holds another slave");
        Err(ConfigError::FoundWrongSlave(slave))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topology_counts_open_ports_with_link() {
        // Port 0 and 1 communicating, port 2 and 3 closed
        assert_eq!(port_topology(0x0A00), (2, 0b0011));
        // Port 0 only, endpoint
        assert_eq!(port_topology(0x5600), (1, 0b0001));
        // Junction with ports 0, 1 and 3
        assert_eq!(port_topology(0x8A00), (3, 0b1011));
    }

    #[test]
    fn parent_of_line_is_previous_slave() {
        let topologies = [0, 2, 2, 2, 1];
        assert_eq!(find_parent(&topologies, 1), 0);
        assert_eq!(find_parent(&topologies, 2), 1);
        assert_eq!(find_parent(&topologies, 4), 3);
    }

    #[test]
    fn parent_after_closed_branch_is_junction() {
        // Slave 1 is a junction, slave 2 an endpoint on its first branch
        let topologies = [0, 3, 1, 1];
        assert_eq!(find_parent(&topologies, 2), 1);
        assert_eq!(find_parent(&topologies, 3), 1);
    }

    #[test]
    fn sub_byte_slaves_share_bytes() {
        let mut builder = ImageBuilder::new(MAX_LRW_DATA_LENGTH);
        let first = builder.place(4);
        let second = builder.place(2);
        let third = builder.place(4);
        let wide = builder.place(16);
        assert_eq!(first, Placement { byte: 0, start_bit: 0, bytes: 1 });
        assert_eq!(second, Placement { byte: 0, start_bit: 4, bytes: 1 });
        assert_eq!(third, Placement { byte: 1, start_bit: 0, bytes: 1 });
        assert_eq!(wide, Placement { byte: 2, start_bit: 0, bytes: 2 });
        let (segments, length) = builder.finish().unwrap();
        assert_eq!(length, 4);
        assert_eq!(segments.as_slice(), &[4]);
    }

    #[test]
    fn segments_never_split_a_slave() {
        let mut builder = ImageBuilder::new(MAX_LRW_DATA_LENGTH - FIRST_DC_DATAGRAM_SIZE);
        let slave_bits = 400 * 8;
        let placements: Vec<_> = (0..5).map(|_| builder.place(slave_bits)).collect();
        let (segments, length) = builder.finish().unwrap();
        assert_eq!(length, 2000);
        // Three slaves fit in the first segment, the fourth would exceed it
        assert_eq!(segments.as_slice(), &[1200, 800]);
        assert_eq!(placements[3].byte, 1200);
        assert!(segments.iter().all(|&segment| segment as usize <= MAX_LRW_DATA_LENGTH));
    }

    #[test]
    fn overlapped_slaves_start_on_bytes() {
        let mut builder = ImageBuilder::new(MAX_LRW_DATA_LENGTH);
        assert_eq!(builder.place_overlapped(2), 0);
        assert_eq!(builder.place_overlapped(1), 2);
        assert_eq!(builder.place_overlapped(4), 3);
        assert_eq!(builder.finish().unwrap().1, 7);
    }

    #[test]
    fn description_table_is_indexed_by_position() {
        let table = [
            SlaveDescription {
                product: 1,
                ..SlaveDescription::default()
            },
            SlaveDescription {
                product: 2,
                ..SlaveDescription::default()
            },
        ];
        let slave = Slave::default();
        assert_eq!(table[..].describe(2, &slave).unwrap().product, 2);
        assert!(table[..].describe(0, &slave).is_none());
        assert!(table[..].describe(3, &slave).is_none());
    }

    #[test]
    fn description_assigns_sync_managers() {
        let mut slave = Slave::default();
        apply_description(
            &mut slave,
            SlaveDescription {
                name: "EL7031".into(),
                mailbox: Some(MailboxDescription {
                    write_offset: 0x1000,
                    write_length: 128,
                    read_offset: 0x1080,
                    read_length: 128,
                    protocols: 4,
                }),
                outputs: Some(ProcessDataDescription {
                    start_address: 0x1100,
                    bits: 12,
                }),
                inputs: Some(ProcessDataDescription {
                    start_address: 0x1180,
                    bits: 0,
                }),
                ..SlaveDescription::default()
            },
        );
        assert!(slave.has_mailbox());
        assert_eq!(slave.name.as_str(), "EL7031");
        assert_eq!(slave.sync_manager_type[0], SyncManagerType::MailboxWrite);
        assert_eq!(slave.sync_manager_type[1], SyncManagerType::MailboxRead);
        assert_eq!(slave.sync_manager_type[2], SyncManagerType::Outputs);
        assert_eq!(slave.sync_manager[2].sm_length, 2);
        assert_eq!(slave.sync_manager_type[3], SyncManagerType::Unused);
        assert_eq!(slave.output_bits, 12);
        assert_eq!(slave.input_bits, 0);
    }
}
