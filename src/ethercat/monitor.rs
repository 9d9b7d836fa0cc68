//! Supervision of the slaves of a group.
//!
//! [`check_group_state`] is meant for a low priority task running next to the
//! process data loop. It compares the workcounter of the last cycle with the
//! expected one and walks the slaves of the group back to OP: acknowledging
//! errors, promoting SAFEOP, reconfiguring slaves that fell back, marking
//! unresponsive slaves as lost and recovering them once they reappear.

use std::sync::atomic::Ordering;

use log::{info, warn};

use super::{
    config::{reconfig_slave, recover_slave, ConfigError},
    main::{readstate, request_state, statecheck, Context, MailboxHandlerState},
    r#type::{EthercatState, SlaveState, TIMEOUT_MONITOR, TIMEOUT_RETURN},
};

/// What one check did to the slaves of a group
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckReport {
    /// Whether the check ran, it is skipped while the workcounter is complete
    pub checked: bool,

    /// Slaves in SAFEOP with error that were acknowledged
    pub acknowledged: Vec<u16>,

    /// Slaves in SAFEOP requested to OP
    pub promoted: Vec<u16>,

    pub reconfigured: Vec<u16>,

    /// Slaves that stopped responding in this check
    pub lost: Vec<u16>,

    /// Lost slaves that got their configured address back
    pub recovered: Vec<u16>,

    /// Lost slaves that answered again on their own
    pub found: Vec<u16>,
}

/// Check the slaves of `group` after a cycle that returned `work_counter`.
///
/// The scan runs when the workcounter falls short of the expected one or a
/// previous scan left the group flagged. The flag stays set until every slave
/// of the group is back in OP.
///
/// # Errors
/// Returns an error if the link failed or a configuration strategy failed
pub fn check_group_state(context: &Context, group: u8, work_counter: u16) -> Result<CheckReport, ConfigError> {
    let group_ref = context.group(group)?;
    let mut report = CheckReport::default();
    if work_counter >= group_ref.expected_work_counter()
        && !group_ref.check_slaves_states.load(Ordering::Acquire)
    {
        return Ok(report);
    }
    report.checked = true;

    // One or more slaves are not responding
    group_ref.check_slaves_states.store(false, Ordering::Release);
    readstate(context)?;

    for slave in 1..=context.slave_count() {
        let (member, state, is_lost) =
            context.slave(slave, |entry| (group == 0 || entry.group == group, entry.state, entry.is_lost))?;
        if !member {
            continue;
        }

        if state != SlaveState::new(EthercatState::Operational) {
            group_ref.check_slaves_states.store(true, Ordering::Release);
            if state == SlaveState::with_error(EthercatState::SafeOperational) {
                warn!("slave {slave} is in SAFE_OP + ERROR, attempting ack");
                request_state(context, slave, SlaveState::with_error(EthercatState::SafeOperational))?;
                report.acknowledged.push(slave);
            } else if state == SlaveState::new(EthercatState::SafeOperational) {
                warn!("slave {slave} is in SAFE_OP, change to OPERATIONAL");
                request_state(context, slave, SlaveState::new(EthercatState::Operational))?;
                context.slave_mut(slave, |entry| {
                    if entry.mailbox_handler_state == MailboxHandlerState::Lost {
                        entry.mailbox_handler_state = MailboxHandlerState::Cyclic;
                    }
                })?;
                report.promoted.push(slave);
            } else if state.state > EthercatState::None && !(is_lost && state.state <= EthercatState::Init) {
                let reached = reconfig_slave(context, slave, TIMEOUT_MONITOR)?;
                if reached.state >= EthercatState::PreOperational {
                    context.slave_mut(slave, |entry| entry.is_lost = false)?;
                    info!("slave {slave} reconfigured");
                    report.reconfigured.push(slave);
                }
            } else if !is_lost {
                // Re-check state
                let outcome = statecheck(context, slave, EthercatState::Operational, TIMEOUT_RETURN)?;
                if outcome.state().state == EthercatState::None {
                    context.slave_mut(slave, |entry| {
                        entry.is_lost = true;
                        if entry.mailbox_handler_state == MailboxHandlerState::Cyclic {
                            entry.mailbox_handler_state = MailboxHandlerState::Lost;
                        }
                    })?;
                    context.zero_slave_inputs(slave)?;
                    warn!("slave {slave} lost");
                    report.lost.push(slave);
                }
            }
        }

        let (state, is_lost) = context.slave(slave, |entry| (entry.state, entry.is_lost))?;
        if is_lost && !report.lost.contains(&slave) {
            // A power cycled slave answers broadcasts in INIT without its address
            if state.state <= EthercatState::Init {
                match recover_slave(context, slave, TIMEOUT_MONITOR) {
                    Ok(()) => {
                        context.slave_mut(slave, |entry| entry.is_lost = false)?;
                        info!("slave {slave} recovered");
                        report.recovered.push(slave);
                    }
                    Err(ConfigError::SlaveFailsToRespond(_) | ConfigError::FoundWrongSlave(_)) => {}
                    Err(err) => return Err(err),
                }
            } else {
                context.slave_mut(slave, |entry| entry.is_lost = false)?;
                info!("slave {slave} found");
                report.found.push(slave);
            }
        }
    }

    if !group_ref.check_slaves_states.load(Ordering::Acquire) {
        info!("group {group} all slaves resumed OPERATIONAL");
    }
    Ok(report)
}
