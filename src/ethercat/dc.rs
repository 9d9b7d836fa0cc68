//! Distributed Clock EtherCAT functions.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::debug;

use super::{
    base::{bwr, fprd, fpwr},
    main::{Context, MainError, Slave},
    r#type::{EthercatRegister, TIMEOUT_RETURN},
};

pub const PORTM: [u8; 4] = [1, 2, 4, 8];

/// First sync pulse delay
pub const SYNC_DELAY: Duration = Duration::from_millis(100);

/// Seconds between 1970-01-01 and 2000-01-01, the EtherCAT epoch
const ETHERCAT_EPOCH: u64 = 946_684_800;

/// Current master time in nanoseconds since 2000-01-01
fn master_time() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |since_unix| {
            since_unix
                .saturating_sub(Duration::from_secs(ETHERCAT_EPOCH))
                .as_nanos() as i64
        })
}

/// First trigger time after `local_time`: a whole multiple of `cycle` past
/// the sync delay, plus the shift, which may be negative.
///
/// Slaves with the same cycle time fire at the same moment this way. The
/// arithmetic wraps like the 64 bit system time of the slaves.
pub fn first_trigger_time(local_time: u64, cycle: Duration, shift: i32) -> i64 {
    let start = local_time.wrapping_add(SYNC_DELAY.as_nanos() as u64);
    let cycle = u64::try_from(cycle.as_nanos()).unwrap_or(u64::MAX);
    let aligned = if cycle > 0 {
        (start / cycle * cycle).wrapping_add(cycle)
    } else {
        start
    };
    (aligned as i64).wrapping_add(i64::from(shift))
}

/// Sync0 cycle times the smallest multiple of it longer than the sync1 cycle
fn sync1_true_cycle(cycle_time0: Duration, cycle_time1: Duration) -> Duration {
    if cycle_time0.is_zero() {
        return cycle_time0;
    }
    let multiple = cycle_time1.as_nanos() / cycle_time0.as_nanos() + 1;
    cycle_time0.saturating_mul(u32::try_from(multiple).unwrap_or(u32::MAX))
}

fn program_sync(
    context: &Context,
    slave: u16,
    activation: u8,
    cycles: &[(EthercatRegister, Duration)],
    true_cycle: Duration,
    cycle_shift: i32,
) -> Result<(), MainError> {
    let address = context.slave(slave, |entry| entry.config_address)?;
    let port = &context.port;

    // Stop cyclic operation, ready for next trigger
    fpwr(port, address, EthercatRegister::DistributedClockSynchronizationActive.into(), &[0], TIMEOUT_RETURN)?;

    // Write access to ethercat
    fpwr(port, address, EthercatRegister::DistributedClockControlUnit.into(), &[0], TIMEOUT_RETURN)?;

    // Read local time of slave
    let mut local_time = [0; 8];
    fprd(port, address, EthercatRegister::DistributedClockSystemTime.into(), &mut local_time, TIMEOUT_RETURN)?;
    let start = first_trigger_time(u64::from_le_bytes(local_time), true_cycle, cycle_shift);

    // SYNC0 start time
    fpwr(port, address, EthercatRegister::DistributedClockStart0.into(), &start.to_le_bytes(), TIMEOUT_RETURN)?;
    for &(register, cycle) in cycles {
        let cycle = u32::try_from(cycle.as_nanos()).unwrap_or(u32::MAX);
        fpwr(port, address, register.into(), &cycle.to_le_bytes(), TIMEOUT_RETURN)?;
    }

    fpwr(
        port,
        address,
        EthercatRegister::DistributedClockSynchronizationActive.into(),
        &[activation],
        TIMEOUT_RETURN,
    )?;
    Ok(())
}

/// Set DC of slave to fire sync0 at `cycle_time` interval with `cycle_shift` offset.
///
/// # Parameters
/// - `context`: Context struct
/// - `slave`: Slave number
/// - `active`: true if active, false if deactivated
/// - `cycle_time`: Cycle time duration
/// - `cycle_shift`: Cycle shift in nanoseconds
///
/// # Errors
/// Returns an error if the slave does not exist or the link failed
pub fn dsync0(
    context: &Context,
    slave: u16,
    active: bool,
    cycle_time: Duration,
    cycle_shift: i32,
) -> Result<(), MainError> {
    // Activate cyclic operation and sync0
    let activation = if active { 1 + 2 } else { 0 };
    program_sync(
        context,
        slave,
        activation,
        &[(EthercatRegister::DistributedClockCycle0, cycle_time)],
        cycle_time,
        cycle_shift,
    )?;
    context.slave_mut(slave, |entry| {
        entry.dc_active = active;
        entry.dc_shift = cycle_shift;
        entry.dc_cycle = cycle_time.as_nanos() as u32;
    })?;
    debug!("slave {slave} sync0 {cycle_time:?} shift {cycle_shift} ns, active {active}");
    Ok(())
}

/// Set distributed clock of slave to fire sync0 and sync1 at cycle_time interval with cycle_shift
/// offset.
///
/// # Parameters
/// - `context`: Context struct
/// - `slave`: Slave number
/// - `active`: true if active, false if deactivated
/// - `cycle_time0`: Cycle time SYNC0 duration
/// - `cycle_time1`: Cycle time SYNC1 duration. This time is a delta time in relation to
///                  the sync0 fire. If `cycle_time1` == 0, SYNC1 fires at the same time
///                  as SYNC0.
/// - `cycle_shift`: Cycleshift in nanoseconds
///
/// # Errors
/// Returns an error if the slave does not exist or the link failed
pub fn dsync01(
    context: &Context,
    slave: u16,
    active: bool,
    cycle_time0: Duration,
    cycle_time1: Duration,
    cycle_shift: i32,
) -> Result<(), MainError> {
    // Sync1 can be used as a multiple of sync0, use true cycle time
    let true_cycle_time = sync1_true_cycle(cycle_time0, cycle_time1);

    // Activate cyclic operation, sync0 and sync1
    let activation = if active { 1 + 2 + 4 } else { 0 };
    program_sync(
        context,
        slave,
        activation,
        &[
            (EthercatRegister::DistributedClockCycle0, cycle_time0),
            (EthercatRegister::DistributedClockCycle1, cycle_time1),
        ],
        true_cycle_time,
        cycle_shift,
    )?;
    context.slave_mut(slave, |entry| {
        entry.dc_active = active;
        entry.dc_shift = cycle_shift;
        entry.dc_cycle = cycle_time0.as_nanos() as u32;
    })?;
    debug!("slave {slave} sync0 {cycle_time0:?} sync1 {cycle_time1:?} shift {cycle_shift} ns, active {active}");
    Ok(())
}

/// Latched port time of slave
fn port_time(slave: &Slave, port: u8) -> i32 {
    slave
        .dc_receive_times
        .get(usize::from(port))
        .copied()
        .unwrap_or_default()
}

/// Previous active port of slave, in the frame order 0 - 3 - 1 - 2
fn previous_port(slave: &Slave, port: u8) -> u8 {
    let candidates: [u8; 3] = match port {
        0 => [2, 1, 3],
        1 => [3, 0, 2],
        2 => [1, 3, 0],
        3 => [0, 2, 1],
        _ => return port,
    };
    candidates
        .into_iter()
        .find(|&candidate| slave.active_ports & PORTM[usize::from(candidate)] != 0)
        .unwrap_or(port)
}

/// Search unconsumed ports in parent, consume and return first open port
fn parent_port(parent: &mut Slave) -> u8 {
    // Search order is important here, 3 - 1 - 2 - 0
    let port = [3, 1, 2]
        .into_iter()
        .find(|&port| parent.consumed_ports & PORTM[usize::from(port)] != 0)
        .unwrap_or(0);
    parent.consumed_ports &= !PORTM[usize::from(port)];
    port
}

/// Port with the earliest receive time, which the frame entered through
fn entry_port(slave: &Slave) -> u8 {
    // Frame order of the ports
    [0, 3, 1, 2]
        .into_iter()
        .filter(|&port| slave.active_ports & PORTM[usize::from(port)] != 0)
        .fold(None, |entry: Option<u8>, port| match entry {
            Some(entry) if port_time(slave, entry) <= port_time(slave, port) => Some(entry),
            _ => Some(port),
        })
        .unwrap_or(0)
}

/// Store the receive times of DC slave `index` and derive its propagation
/// delay from its DC parent.
///
/// Returns the delay to program, `None` for a slave without DC parent.
fn measure_slave(slaves: &mut [Slave], index: u16, receive_times: [i32; 4]) -> Option<i32> {
    let i = usize::from(index);
    slaves[i].dc_receive_times = receive_times;
    let entry = entry_port(&slaves[i]);
    slaves[i].entry_port = entry;

    // Consume entryport from active ports
    slaves[i].consumed_ports &= !PORTM[usize::from(entry)];

    // Finding DC parent of current
    let mut parent = index;
    let mut child;
    loop {
        child = parent;
        parent = slaves[usize::from(parent)].parent;
        if parent == 0 || parent >= index || slaves[usize::from(parent)].has_dc {
            break;
        }
    }
    if parent == 0 || parent >= index {
        return None;
    }
    let p = usize::from(parent);

    // Find port on parent this slave is connected to
    let mut parent_port_number = parent_port(&mut slaves[p]);
    if slaves[p].topology == 1 {
        parent_port_number = slaves[p].entry_port;
    }
    slaves[i].parent_port = parent_port_number;

    // Delta time of (parentport - 1) - parentport
    let dt3 = port_time(&slaves[p], parent_port_number)
        .wrapping_sub(port_time(&slaves[p], previous_port(&slaves[p], parent_port_number)));

    // Current slave has children, their delays need to be subtracted
    let mut dt1 = if slaves[i].topology > 1 {
        port_time(&slaves[i], previous_port(&slaves[i], entry))
            .wrapping_sub(port_time(&slaves[i], entry))
    } else {
        0
    };
    if dt1 > dt3 {
        dt1 = -dt1;
    }

    // Current slave is not the first child of parent, previous child's delays need to be added
    let dt2 = if child - parent > 1 {
        port_time(&slaves[p], previous_port(&slaves[p], parent_port_number))
            .wrapping_sub(port_time(&slaves[p], slaves[p].entry_port))
            .wrapping_abs()
    } else {
        0
    };

    // Assumption: forward delay equals return delay
    let delay = (dt3.wrapping_sub(dt1) / 2)
        .wrapping_add(dt2)
        .wrapping_add(slaves[p].propagation_delay);
    slaves[i].propagation_delay = delay;
    Some(delay)
}

/// Locate DC slaves, measure propagation delays.
///
/// Latches the receive times of all slaves, sets the system time offset of
/// every DC slave to the master time, writes the propagation delays and
/// chains the DC slaves through `dc_next`/`dc_previous`. Every group learns
/// its first DC slave, which serves as its reference clock.
///
/// # Returns
/// Whether any slaves were found with Digital Clock
///
/// # Errors
/// Returns an error if the link failed
pub fn config_dc(context: &mut Context) -> Result<bool, MainError> {
    let port = &context.port;

    // Latch DC receive time of all slaves
    bwr(port, 0, EthercatRegister::DistributedClockTime0.into(), &[0; 4], TIMEOUT_RETURN)?;
    let master_time = master_time();

    let mut previous_dc_slave = 0;
    let mut parent_hold = 0;
    for index in 1..=context.slave_count() {
        let (address, has_dc) = context.slave_mut(index, |slave| {
            slave.consumed_ports = slave.active_ports;
            (slave.config_address, slave.has_dc)
        })?;

        if !has_dc {
            let mut slaves = context.slaves_mut();
            let slave = &mut slaves[usize::from(index)];
            slave.dc_receive_times = [0; 4];
            let parent = slave.parent;
            let topology = slave.topology;

            // If non DC slave found on first position on branch, hold root parent
            if parent > 0 && slaves[usize::from(parent)].topology > 2 {
                parent_hold = parent;
            }

            // If branch has no DC slaves, consume port on root parent
            if parent_hold != 0 && topology == 1 {
                parent_port(&mut slaves[usize::from(parent_hold)]);
                parent_hold = 0;
            }
            continue;
        }

        // Receive times of port 0 to 3
        let mut latched = [0; 16];
        fprd(port, address, EthercatRegister::DistributedClockTime0.into(), &mut latched, TIMEOUT_RETURN)?;
        let receive_times = std::array::from_fn(|n| {
            i32::from_le_bytes([latched[n * 4], latched[n * 4 + 1], latched[n * 4 + 2], latched[n * 4 + 3]])
        });

        // 64 bit latched receive time of the processing unit, used as offset to
        // set the local time around the master time
        let mut local = [0; 8];
        fprd(port, address, EthercatRegister::DistributedClockStartOfFrame.into(), &mut local, TIMEOUT_RETURN)?;
        let offset = master_time.wrapping_sub(i64::from_le_bytes(local));
        fpwr(port, address, EthercatRegister::DistributedClockSystemOffset.into(), &offset.to_le_bytes(), TIMEOUT_RETURN)?;

        let delay = {
            let mut slaves = context.slaves_mut();
            if previous_dc_slave == 0 {
                slaves[0].dc_next = index;
                slaves[usize::from(index)].dc_previous = 0;
            } else {
                slaves[usize::from(previous_dc_slave)].dc_next = index;
                slaves[usize::from(index)].dc_previous = previous_dc_slave;
            }
            measure_slave(&mut slaves, index, receive_times)
        };
        previous_dc_slave = index;

        // This branch has a DC slave so remove parent hold
        parent_hold = 0;

        if let Some(delay) = delay {
            fpwr(port, address, EthercatRegister::DistributedClockSystemDelay.into(), &delay.to_le_bytes(), TIMEOUT_RETURN)?;
            debug!("slave {index} propagation delay {delay} ns");
        }
    }

    let first_dc_slaves: Vec<Option<u16>> = {
        let mut slaves = context.slaves_mut();
        slaves[0].has_dc = previous_dc_slave != 0;
        (0..context.grouplist.len())
            .map(|group| {
                slaves
                    .iter()
                    .enumerate()
                    .skip(1)
                    .find(|(_, slave)| slave.has_dc && (group == 0 || usize::from(slave.group) == group))
                    .map(|(index, _)| index as u16)
            })
            .collect()
    };
    for (group, first) in context.grouplist.iter_mut().zip(first_dc_slaves) {
        group.has_dc = first.is_some();
        group.dc_next = first.unwrap_or_default();
    }
    Ok(previous_dc_slave != 0)
}
