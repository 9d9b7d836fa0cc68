//! Mailbox transfers.
//!
//! Every mailbox, outbound or inbound, lives in a buffer leased from the
//! [`MailboxPool`] of the context. Slaves switched to cyclic mailbox handling
//! have their transfers queued on the [`MailboxQueue`] of their group and
//! serviced by [`mailbox_handler`] from the process data loop; other slaves
//! are served directly by polling their sync manager status.

use std::{
    fmt,
    time::{Duration, Instant, SystemTime},
};

use heapless::Vec as HeaplessVec;
use log::{debug, error, trace, warn};

use crate::osal::{usleep, OsalTimer};

use super::{
    base::{fprd, fpwr},
    main::{
        answered, lock, push_error, Context, MailboxHandlerState, MailboxHeader, MainError,
        MAILBOX_HEADER_SIZE, MAILBOX_POOL_SIZE, MAX_MAILBOX_SIZE,
    },
    r#type::{
        AbortError, COEMailboxType, ErrorInfo, ErrorType, EthercatRegister, MailboxType, TIMEOUT_RETURN,
    },
    ReadFrom,
};

/// Full flag in the sync manager status register
const SYNC_MANAGER_FULL: u8 = 0x08;

/// Poll interval while waiting for a mailbox
const MAILBOX_POLL: u64 = 200;

/// Fixed size buffer leased from a [`MailboxPool`]
pub struct MailboxBuffer {
    slot: usize,
    data: Box<[u8; MAX_MAILBOX_SIZE]>,
}

impl MailboxBuffer {
    /// Pool slot the buffer belongs to
    pub const fn slot(&self) -> usize {
        self.slot
    }

    /// # Errors
    /// Returns an error if the header is malformed
    pub fn header(&self) -> Result<MailboxHeader, MainError> {
        Ok(MailboxHeader::read_from(&mut &self.data[..])?)
    }

    /// Mailbox type found in the header
    ///
    /// # Errors
    /// Returns an error if the type is unknown
    pub fn mailbox_type(&self) -> Result<MailboxType, MainError> {
        self.header()?.protocol()
    }
}

impl fmt::Debug for MailboxBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MailboxBuffer")
            .field("slot", &self.slot)
            .field("header", &self.header().ok())
            .finish_non_exhaustive()
    }
}

impl AsRef<[u8]> for MailboxBuffer {
    fn as_ref(&self) -> &[u8] {
        &self.data[..]
    }
}

impl AsMut<[u8]> for MailboxBuffer {
    fn as_mut(&mut self) -> &mut [u8] {
        &mut self.data[..]
    }
}

/// Fixed pool of mailbox buffers
#[derive(Debug)]
pub struct MailboxPool {
    free: Vec<Option<Box<[u8; MAX_MAILBOX_SIZE]>>>,
}

impl Default for MailboxPool {
    fn default() -> Self {
        Self::new()
    }
}

impl MailboxPool {
    pub fn new() -> Self {
        Self {
            free: (0..MAILBOX_POOL_SIZE)
                .map(|_| Some(Box::new([0; MAX_MAILBOX_SIZE])))
                .collect(),
        }
    }

    /// Lease a zeroed buffer
    ///
    /// # Errors
    /// Returns [`MainError::PoolExhausted`] if every buffer is leased
    pub fn lease(&mut self) -> Result<MailboxBuffer, MainError> {
        let (slot, data) = self
            .free
            .iter_mut()
            .enumerate()
            .find_map(|(slot, data)| data.take().map(|data| (slot, data)))
            .ok_or(MainError::PoolExhausted)?;
        let mut buffer = MailboxBuffer { slot, data };
        buffer.data.fill(0);
        Ok(buffer)
    }

    /// Return a leased buffer
    ///
    /// # Errors
    /// Returns [`MainError::MailboxNotLeased`] if the slot of the buffer is already free
    pub fn give_back(&mut self, buffer: MailboxBuffer) -> Result<(), MainError> {
        match self.free.get_mut(buffer.slot) {
            Some(slot @ None) => {
                *slot = Some(buffer.data);
                Ok(())
            }
            _ => Err(MainError::MailboxNotLeased(buffer.slot)),
        }
    }

    pub fn available(&self) -> usize {
        self.free.iter().filter(|slot| slot.is_some()).count()
    }
}

/// Return a buffer to the pool of the context, logging contract violations
pub fn release_mailbox(context: &Context, buffer: MailboxBuffer) {
    if let Err(err) = context.mailbox_pool().give_back(buffer) {
        error!("{err}");
    }
}

/// State of a queued mailbox request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestState {
    #[default]
    None,
    Requested,
    Failed,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Write the buffer of the request to the slave
    Send,

    /// Wait for an inbound mailbox of the given type
    Receive(MailboxType),
}

/// Unique identification of a queued request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ticket(u32);

#[derive(Debug)]
pub struct QueueEntry {
    pub slave: u16,
    pub direction: Direction,
    pub state: RequestState,

    /// Reclaim the entry as soon as it completed, nobody waits for it
    pub remove: bool,
    pub ticket: Ticket,
    buffer: Option<MailboxBuffer>,
    deadline: Instant,
}

/// Returned by [`MailboxQueue::enqueue`] with the buffer that was not queued
#[derive(Debug)]
pub struct QueueFull(pub Option<MailboxBuffer>);

/// Pending request handed to the cyclic handler
#[derive(Debug, Clone, Copy)]
struct Job {
    ticket: Ticket,
    slave: u16,
    direction: Direction,
    expired: bool,
}

/// FIFO of the mailbox requests of one group
#[derive(Debug, Default)]
pub struct MailboxQueue {
    entries: HeaplessVec<QueueEntry, MAILBOX_POOL_SIZE>,
    last_ticket: u32,

    /// Slave the inbound scan of the handler continues after
    last_slave: u16,
}

impl MailboxQueue {
    /// Queue a request, it is in state [`RequestState::Requested`] on return
    ///
    /// # Errors
    /// Returns the buffer if the queue is full
    pub fn enqueue(
        &mut self,
        slave: u16,
        buffer: Option<MailboxBuffer>,
        direction: Direction,
        remove: bool,
        timeout: Duration,
    ) -> Result<Ticket, QueueFull> {
        if self.entries.is_full() {
            return Err(QueueFull(buffer));
        }
        self.last_ticket = self.last_ticket.wrapping_add(1).max(1);
        let ticket = Ticket(self.last_ticket);
        let mut entry = QueueEntry {
            slave,
            direction,
            state: RequestState::None,
            remove,
            ticket,
            buffer,
            deadline: Instant::now() + timeout,
        };
        advance(&mut entry, RequestState::Requested);
        self.entries
            .push(entry)
            .map_err(|entry| QueueFull(entry.buffer))?;
        Ok(ticket)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn position(&self, ticket: Ticket) -> Option<usize> {
        self.entries.iter().position(|entry| entry.ticket == ticket)
    }

    pub fn state(&self, ticket: Ticket) -> Option<RequestState> {
        self.position(ticket).map(|position| self.entries[position].state)
    }

    /// Reclaim a completed request, handing out its buffer
    pub fn take_completed(&mut self, ticket: Ticket) -> Option<(RequestState, Option<MailboxBuffer>)> {
        let position = self.position(ticket)?;
        if !matches!(self.entries[position].state, RequestState::Done | RequestState::Failed) {
            return None;
        }
        let entry = self.entries.remove(position);
        Some((entry.state, entry.buffer))
    }

    /// Drop a request whatever its state
    pub fn cancel(&mut self, ticket: Ticket) -> Option<MailboxBuffer> {
        let position = self.position(ticket)?;
        self.entries.remove(position).buffer
    }

    fn pending(&self) -> Vec<Job> {
        let now = Instant::now();
        self.entries
            .iter()
            .filter(|entry| entry.state == RequestState::Requested)
            .map(|entry| Job {
                ticket: entry.ticket,
                slave: entry.slave,
                direction: entry.direction,
                expired: now >= entry.deadline,
            })
            .collect()
    }

    /// Take the buffer of a request while the handler works on it
    fn checkout(&mut self, ticket: Ticket) -> Option<MailboxBuffer> {
        let position = self.position(ticket)?;
        self.entries[position].buffer.take()
    }

    /// Put back the buffer of a request that stays pending
    fn restore(&mut self, ticket: Ticket, buffer: MailboxBuffer) -> Option<MailboxBuffer> {
        match self.position(ticket) {
            Some(position) => {
                self.entries[position].buffer = Some(buffer);
                None
            }
            None => Some(buffer),
        }
    }

    /// Finish a request. Returns a buffer nobody will pick up anymore.
    fn complete(
        &mut self,
        ticket: Ticket,
        state: RequestState,
        buffer: Option<MailboxBuffer>,
    ) -> Option<MailboxBuffer> {
        let Some(position) = self.position(ticket) else {
            return buffer;
        };
        let entry = &mut self.entries[position];
        if buffer.is_some() {
            entry.buffer = buffer;
        }
        advance(entry, state);
        if entry.remove {
            self.entries.remove(position).buffer
        } else {
            None
        }
    }
}

/// Move an entry forward, requests only go NONE, REQUESTED, then DONE or FAILED
fn advance(entry: &mut QueueEntry, to: RequestState) {
    let allowed = matches!(
        (entry.state, to),
        (RequestState::None, RequestState::Requested)
            | (RequestState::Requested, RequestState::Done | RequestState::Failed)
    );
    if allowed {
        entry.state = to;
    } else {
        error!(
            "mailbox request {:?} cannot go from {:?} to {:?}",
            entry.ticket, entry.state, to
        );
    }
}

fn mailbox_error(context: &Context, slave: u16, error_type: ErrorType, code: u16) {
    push_error(
        context,
        ErrorInfo {
            time: SystemTime::now(),
            signal: true,
            slave,
            index: 0,
            sub_index: 0,
            error_type,
            abort_error: AbortError::ErrorCode(code),
        },
    );
}

fn is_emergency(data: &[u8]) -> bool {
    let can_open = u16::from_le_bytes([data[MAILBOX_HEADER_SIZE], data[MAILBOX_HEADER_SIZE + 1]]);
    can_open >> 12 == u16::from(COEMailboxType::Emergency)
}

/// Record a CoE emergency, it answers no request
fn emergency_error(context: &Context, slave: u16, data: &[u8]) {
    let body = &data[MAILBOX_HEADER_SIZE + 2..];
    let error_code = u16::from_le_bytes([body[0], body[1]]);
    warn!("slave {slave} emergency {error_code:#06x}");
    push_error(
        context,
        ErrorInfo {
            time: SystemTime::now(),
            signal: true,
            slave,
            index: 0,
            sub_index: 0,
            error_type: ErrorType::Emergency,
            abort_error: AbortError::EmergencyError {
                error_code,
                error_register: body[2],
                byte1: body[3],
                word1: u16::from_le_bytes([body[4], body[5]]),
                word2: u16::from_le_bytes([body[6], body[7]]),
            },
        },
    );
}

fn sync_manager_full(context: &Context, address: u16, register: EthercatRegister) -> Result<Option<bool>, MainError> {
    let mut status = [0];
    let wkc = answered(fprd(&context.port, address, register.into(), &mut status, TIMEOUT_RETURN))?;
    Ok((wkc > 0).then_some(status[0] & SYNC_MANAGER_FULL != 0))
}

#[derive(Debug, Clone, Copy)]
struct MailboxLayout {
    address: u16,
    write_offset: u16,
    write_length: u16,
    read_offset: u16,
    read_length: u16,
    handler_state: MailboxHandlerState,
    group: u8,
}

fn layout(context: &Context, slave: u16) -> Result<MailboxLayout, MainError> {
    let layout = context.slave(slave, |entry| MailboxLayout {
        address: entry.config_address,
        write_offset: entry.mailbox_write_offset,
        write_length: entry.mailbox_length,
        read_offset: entry.mailbox_read_offset,
        read_length: entry.mailbox_read_length,
        handler_state: entry.mailbox_handler_state,
        group: entry.group,
    })?;
    if slave == 0 || layout.write_length == 0 || layout.read_length == 0 {
        return Err(MainError::NoMailbox(slave));
    }
    if usize::from(layout.write_length.max(layout.read_length)) > MAX_MAILBOX_SIZE {
        return Err(MainError::MailboxTooLarge(usize::from(layout.write_length.max(layout.read_length))));
    }
    Ok(layout)
}

/// Next value of the mailbox counter of a slave
///
/// # Errors
/// Returns an error if the slave does not exist
pub fn next_slave_mailbox_count(context: &Context, slave: u16) -> Result<u8, MainError> {
    context.slave_mut(slave, |entry| {
        entry.mailbox_count = super::main::next_mailbox_count(entry.mailbox_count);
        entry.mailbox_count
    })
}

/// Switch a slave to cyclic mailbox handling through the queue of its group
///
/// # Errors
/// Returns an error if the slave does not exist or has no mailbox
pub fn slave_mailbox_cyclic(context: &Context, slave: u16) -> Result<(), MainError> {
    let layout = layout(context, slave)?;
    context.group(layout.group)?;
    context.slave_mut(slave, |entry| entry.mailbox_handler_state = MailboxHandlerState::Cyclic)?;
    debug!("slave {slave} mailbox handled cyclically");
    Ok(())
}

/// Wait until the write mailbox of a slave is empty
///
/// # Errors
/// Returns an error if the slave has no mailbox or the link failed
pub fn mailbox_empty(context: &Context, slave: u16, timeout: Duration) -> Result<bool, MainError> {
    let layout = layout(context, slave)?;
    let timer = OsalTimer::new(timeout);
    loop {
        if sync_manager_full(context, layout.address, EthercatRegister::SyncManager0Status)? == Some(false) {
            return Ok(true);
        }
        if timer.is_expired() {
            return Ok(false);
        }
        usleep(MAILBOX_POLL);
    }
}

/// Read the read mailbox of a slave if it is full, routing it into the inbox of
/// its protocol. Returns whether a mailbox was read.
fn poll_inbound(context: &Context, slave: u16, layout: &MailboxLayout) -> Result<bool, MainError> {
    if sync_manager_full(context, layout.address, EthercatRegister::SyncManager1Status)? != Some(true) {
        return Ok(false);
    }
    read_inbound(context, slave, layout)
}

/// Whether `count` repeats the counter of the last mailbox read from `slave`.
/// Counter 0 is never checked.
fn repeated_count(context: &Context, slave: u16, count: u8) -> Result<bool, MainError> {
    context.slave_mut(slave, |entry| {
        if count == 0 {
            return false;
        }
        if count == entry.mailbox_read_count {
            entry.mailbox_degraded = true;
            return true;
        }
        entry.mailbox_read_count = count;
        false
    })
}

/// Read the read mailbox of a slave known to be full
fn read_inbound(context: &Context, slave: u16, layout: &MailboxLayout) -> Result<bool, MainError> {
    let mut buffer = match context.mailbox_pool().lease() {
        Ok(buffer) => buffer,
        Err(MainError::PoolExhausted) => {
            trace!("no buffer for inbound mailbox of slave {slave}");
            return Ok(false);
        }
        Err(err) => return Err(err),
    };
    let length = usize::from(layout.read_length);
    let wkc = match answered(fprd(
        &context.port,
        layout.address,
        layout.read_offset,
        &mut buffer.as_mut()[..length],
        TIMEOUT_RETURN,
    )) {
        Ok(wkc) => wkc,
        Err(err) => {
            release_mailbox(context, buffer);
            return Err(err);
        }
    };
    if wkc == 0 {
        release_mailbox(context, buffer);
        return Ok(false);
    }

    let count = buffer.header().map(|header| header.count()).unwrap_or_default();
    match repeated_count(context, slave, count) {
        Ok(false) => {}
        Ok(true) => {
            warn!("slave {slave} repeated mailbox counter {count}, mailbox dropped");
            mailbox_error(context, slave, ErrorType::MailboxRepeated, u16::from(count));
            release_mailbox(context, buffer);
            return Ok(true);
        }
        Err(err) => {
            release_mailbox(context, buffer);
            return Err(err);
        }
    }

    match buffer.mailbox_type() {
        Ok(MailboxType::Error) => {
            let data = buffer.as_ref();
            let detail = u16::from_le_bytes([data[MAILBOX_HEADER_SIZE + 2], data[MAILBOX_HEADER_SIZE + 3]]);
            warn!("slave {slave} replied mailbox error {detail}");
            mailbox_error(context, slave, ErrorType::MailboxError, detail);
            release_mailbox(context, buffer);
        }
        Ok(MailboxType::CanopenOverEthercat) if is_emergency(buffer.as_ref()) => {
            emergency_error(context, slave, buffer.as_ref());
            release_mailbox(context, buffer);
        }
        Ok(mailbox_type) => {
            let rejected = context.slave_mut(slave, |entry| entry.mailbox_inbox.store(mailbox_type, buffer))?;
            if let Err(buffer) = rejected {
                warn!("slave {slave} {mailbox_type:?} mailbox overrun");
                mailbox_error(context, slave, ErrorType::MailboxOverrun, u16::from(u8::from(mailbox_type)));
                release_mailbox(context, buffer);
            }
        }
        Err(err) => {
            warn!("slave {slave} sent unroutable mailbox: {err}");
            release_mailbox(context, buffer);
        }
    }
    Ok(true)
}

fn write_mailbox(context: &Context, layout: &MailboxLayout, buffer: &MailboxBuffer) -> Result<bool, MainError> {
    let length = usize::from(layout.write_length);
    let wkc = answered(fpwr(
        &context.port,
        layout.address,
        layout.write_offset,
        &buffer.as_ref()[..length],
        TIMEOUT_RETURN,
    ))?;
    Ok(wkc > 0)
}

/// Write the mailbox if the write mailbox of the slave is empty
fn try_write_mailbox(context: &Context, layout: &MailboxLayout, buffer: &MailboxBuffer) -> Result<bool, MainError> {
    if sync_manager_full(context, layout.address, EthercatRegister::SyncManager0Status)? != Some(false) {
        return Ok(false);
    }
    write_mailbox(context, layout, buffer)
}

/// Fail a request that expired or whose slave is lost. The mailbox of the
/// slave counts as degraded until a request completes again, its EtherCAT
/// state is left to the state monitor.
fn fail_request(context: &Context, slave: u16, mailbox_type: Option<MailboxType>) -> Result<(), MainError> {
    warn!("mailbox request of slave {slave} failed");
    context.slave_mut(slave, |entry| {
        entry.mailbox_degraded = true;
        if let Some(mailbox_type) = mailbox_type {
            entry.mailbox_inbox.count_overrun(mailbox_type);
        }
    })
}

fn complete_request(context: &Context, slave: u16) -> Result<(), MainError> {
    context.slave_mut(slave, |entry| entry.mailbox_degraded = false)
}

/// Service the mailboxes of a group.
///
/// Inbound mailboxes of cyclic slaves are routed into their protocol inbox,
/// then queued requests are advanced. Slaves whose read mailbox status is
/// mapped into the process image are only read when the last cycle showed a
/// full mailbox, the others have their status polled.
///
/// `limit` bounds the bus exchanges of one call: status polls, mailbox reads
/// and mailbox writes. A scan cut short resumes with the same slave on the
/// next call. Returns the number of completed transfers.
///
/// # Errors
/// Returns an error if the group does not exist or the link failed
pub fn mailbox_handler(context: &Context, group: u8, limit: usize) -> Result<usize, MainError> {
    let group_ref = context.group(group)?;
    let queue = &group_ref.mailbox_queue;
    let mut budget = limit;
    let mut processed = 0;

    let cyclic: Vec<u16> = context
        .slaves()
        .iter()
        .enumerate()
        .skip(1)
        .filter(|(_, slave)| {
            (group == 0 || slave.group == group)
                && slave.mailbox_handler_state == MailboxHandlerState::Cyclic
        })
        .map(|(slave, _)| slave as u16)
        .collect();
    if !cyclic.is_empty() {
        let last = lock(queue).last_slave;
        let start = cyclic.iter().position(|&slave| slave > last).unwrap_or(0);
        for &slave in cyclic.iter().cycle().skip(start).take(cyclic.len()) {
            let layout = layout(context, slave)?;
            let mapped = group_ref
                .mailbox_status
                .iter()
                .find(|&&(owner, _)| owner == slave)
                .map(|&(_, offset)| offset);
            let full = match mapped {
                Some(offset) => group_ref
                    .io_map()
                    .get(offset)
                    .is_some_and(|status| status & SYNC_MANAGER_FULL != 0),
                None if budget == 0 => break,
                None => {
                    budget -= 1;
                    sync_manager_full(context, layout.address, EthercatRegister::SyncManager1Status)? == Some(true)
                }
            };
            if full {
                if budget == 0 {
                    break;
                }
                budget -= 1;
                if read_inbound(context, slave, &layout)? {
                    processed += 1;
                }
                // Mapped status is stale until the next cycle refreshes it
                if let Some(offset) = mapped {
                    if let Some(status) = group_ref.io_map().get_mut(offset) {
                        *status &= !SYNC_MANAGER_FULL;
                    }
                }
            }
            lock(queue).last_slave = slave;
        }
    }

    let jobs = lock(queue).pending();
    for job in jobs {
        let slave_state = context.slave(job.slave, |entry| entry.mailbox_handler_state)?;
        let lost = slave_state == MailboxHandlerState::Lost;
        let mut outcome = Ok(());
        let orphan = match job.direction {
            Direction::Send => {
                if !lost && budget == 0 {
                    continue;
                }
                let target = layout(context, job.slave)?;
                let Some(buffer) = lock(queue).checkout(job.ticket) else {
                    continue;
                };
                let mailbox_type = buffer.mailbox_type().ok();
                let attempt = if lost {
                    Ok(false)
                } else {
                    budget -= 1;
                    try_write_mailbox(context, &target, &buffer)
                };
                let sent = match attempt {
                    Ok(sent) => sent,
                    Err(err) => {
                        if let Some(buffer) = lock(queue).restore(job.ticket, buffer) {
                            release_mailbox(context, buffer);
                        }
                        return Err(err);
                    }
                };
                if sent {
                    processed += 1;
                    outcome = complete_request(context, job.slave);
                    lock(queue).complete(job.ticket, RequestState::Done, Some(buffer))
                } else if job.expired || lost {
                    outcome = fail_request(context, job.slave, mailbox_type);
                    lock(queue).complete(job.ticket, RequestState::Failed, Some(buffer))
                } else {
                    lock(queue).restore(job.ticket, buffer)
                }
            }
            Direction::Receive(mailbox_type) => {
                let received = context.slave_mut(job.slave, |entry| entry.mailbox_inbox.take(mailbox_type))?;
                if let Some(buffer) = received {
                    processed += 1;
                    outcome = complete_request(context, job.slave);
                    lock(queue).complete(job.ticket, RequestState::Done, Some(buffer))
                } else if job.expired || lost {
                    outcome = fail_request(context, job.slave, Some(mailbox_type));
                    lock(queue).complete(job.ticket, RequestState::Failed, None)
                } else {
                    None
                }
            }
        };
        if let Some(buffer) = orphan {
            release_mailbox(context, buffer);
        }
        outcome?;
    }
    Ok(processed)
}

/// Wait outside the queue lock for a request to complete
fn wait_ticket(
    context: &Context,
    group: u8,
    slave: u16,
    ticket: Ticket,
    timeout: Duration,
) -> Result<Option<MailboxBuffer>, MainError> {
    let queue = &context.group(group)?.mailbox_queue;
    let timer = OsalTimer::new(timeout);
    loop {
        if let Some((state, buffer)) = lock(queue).take_completed(ticket) {
            if state == RequestState::Done {
                return Ok(buffer);
            }
            if let Some(buffer) = buffer {
                release_mailbox(context, buffer);
            }
            return Err(MainError::MailboxFailed(slave));
        }
        if timer.is_expired() {
            if let Some(buffer) = lock(queue).cancel(ticket) {
                release_mailbox(context, buffer);
            }
            return Err(MainError::MailboxTimeout(slave));
        }
        usleep(MAILBOX_POLL);
    }
}

/// Queue `buffer` for the cyclic handler without waiting for it to be sent
///
/// # Errors
/// Returns an error if the slave has no mailbox or the queue is full
pub fn mailbox_send_queued(context: &Context, slave: u16, buffer: MailboxBuffer, timeout: Duration) -> Result<Ticket, MainError> {
    let layout = layout(context, slave)?;
    let queue = &context.group(layout.group)?.mailbox_queue;
    let result = lock(queue).enqueue(slave, Some(buffer), Direction::Send, true, timeout);
    result.map_err(|QueueFull(buffer)| {
        if let Some(buffer) = buffer {
            release_mailbox(context, buffer);
        }
        MainError::QueueFull
    })
}

/// Write a mailbox to a slave. The buffer returns to the pool in every case.
///
/// # Errors
/// Returns an error if the slave has no mailbox, the mailbox is too large or
/// it could not be delivered within `timeout`
pub fn mailbox_send(context: &Context, slave: u16, buffer: MailboxBuffer, timeout: Duration) -> Result<(), MainError> {
    let layout = match layout(context, slave) {
        Ok(layout) => layout,
        Err(err) => {
            release_mailbox(context, buffer);
            return Err(err);
        }
    };
    let length = buffer
        .header()
        .map(|header| usize::from(header.length) + MAILBOX_HEADER_SIZE)
        .unwrap_or_default();
    if length > usize::from(layout.write_length) {
        release_mailbox(context, buffer);
        return Err(MainError::MailboxTooLarge(length));
    }

    if layout.handler_state == MailboxHandlerState::Cyclic {
        let queue = &context.group(layout.group)?.mailbox_queue;
        let enqueued = lock(queue).enqueue(slave, Some(buffer), Direction::Send, false, timeout);
        let ticket = enqueued.map_err(|QueueFull(buffer)| {
            if let Some(buffer) = buffer {
                release_mailbox(context, buffer);
            }
            MainError::QueueFull
        })?;
        if let Some(buffer) = wait_ticket(context, layout.group, slave, ticket, timeout)? {
            release_mailbox(context, buffer);
        }
        return Ok(());
    }

    let timer = OsalTimer::new(timeout);
    let result = loop {
        match mailbox_empty(context, slave, timer.remaining())
            .and_then(|empty| if empty { write_mailbox(context, &layout, &buffer) } else { Ok(false) })
        {
            Ok(true) => break Ok(()),
            Ok(false) if !timer.is_expired() => usleep(MAILBOX_POLL),
            Ok(false) => break Err(MainError::MailboxTimeout(slave)),
            Err(err) => break Err(err),
        }
    };
    release_mailbox(context, buffer);
    result
}

/// Receive the next mailbox of `mailbox_type` from a slave. Mailboxes of other
/// protocols arriving meanwhile are kept in their inbox.
///
/// The returned buffer belongs to the caller until given back to the pool. A
/// received mailbox clears a degraded mailbox of the slave.
///
/// # Errors
/// Returns an error if the slave has no mailbox or nothing arrived within `timeout`
pub fn mailbox_receive(
    context: &Context,
    slave: u16,
    mailbox_type: MailboxType,
    timeout: Duration,
) -> Result<MailboxBuffer, MainError> {
    let buffer = receive(context, slave, mailbox_type, timeout)?;
    if let Err(err) = complete_request(context, slave) {
        release_mailbox(context, buffer);
        return Err(err);
    }
    Ok(buffer)
}

fn receive(
    context: &Context,
    slave: u16,
    mailbox_type: MailboxType,
    timeout: Duration,
) -> Result<MailboxBuffer, MainError> {
    let layout = layout(context, slave)?;
    if let Some(buffer) = context.slave_mut(slave, |entry| entry.mailbox_inbox.take(mailbox_type))? {
        return Ok(buffer);
    }

    if layout.handler_state == MailboxHandlerState::Cyclic {
        // The handler fills the inbox, a poll without timeout only looks there
        if timeout.is_zero() {
            return Err(MainError::MailboxTimeout(slave));
        }
        let queue = &context.group(layout.group)?.mailbox_queue;
        let enqueued = lock(queue).enqueue(slave, None, Direction::Receive(mailbox_type), false, timeout);
        let ticket = enqueued.map_err(|_| MainError::QueueFull)?;
        return wait_ticket(context, layout.group, slave, ticket, timeout)?
            .ok_or(MainError::MailboxFailed(slave));
    }

    let timer = OsalTimer::new(timeout);
    loop {
        if poll_inbound(context, slave, &layout)? {
            if let Some(buffer) = context.slave_mut(slave, |entry| entry.mailbox_inbox.take(mailbox_type))? {
                return Ok(buffer);
            }
        }
        if timer.is_expired() {
            return Err(MainError::MailboxTimeout(slave));
        }
        usleep(MAILBOX_POLL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_exhausts_and_recovers() {
        let mut pool = MailboxPool::new();
        let mut leased: Vec<_> = (0..MAILBOX_POOL_SIZE).map(|_| pool.lease().unwrap()).collect();
        assert!(matches!(pool.lease(), Err(MainError::PoolExhausted)));

        let buffer = leased.pop().unwrap();
        let slot = buffer.slot();
        pool.give_back(buffer).unwrap();
        assert_eq!(pool.lease().unwrap().slot(), slot);
    }

    #[test]
    fn buffer_returned_to_free_slot_is_detected() {
        let mut first = MailboxPool::new();
        let mut second = MailboxPool::new();
        let buffer = first.lease().unwrap();
        assert!(matches!(
            second.give_back(buffer),
            Err(MainError::MailboxNotLeased(0))
        ));
    }

    #[test]
    fn leased_buffers_are_zeroed() {
        let mut pool = MailboxPool::new();
        let mut buffer = pool.lease().unwrap();
        buffer.as_mut()[..4].copy_from_slice(&[1, 2, 3, 4]);
        pool.give_back(buffer).unwrap();
        assert!(pool.lease().unwrap().as_ref().iter().all(|&byte| byte == 0));
    }

    #[test]
    fn randomized_lease_and_return_never_double_leases() {
        let mut pool = MailboxPool::new();
        let mut leased: Vec<MailboxBuffer> = Vec::new();
        let mut state = 0x2545_F491_u32;
        for _ in 0..10_000 {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            match state % 3 {
                0 | 1 => match pool.lease() {
                    Ok(buffer) => {
                        assert!(leased.iter().all(|other| other.slot() != buffer.slot()));
                        leased.push(buffer);
                    }
                    Err(MainError::PoolExhausted) => assert_eq!(leased.len(), MAILBOX_POOL_SIZE),
                    Err(err) => panic!("unexpected {err}"),
                },
                _ if leased.is_empty() => {}
                _ => {
                    let buffer = leased.swap_remove(state as usize % leased.len());
                    pool.give_back(buffer).unwrap();
                }
            }
            assert_eq!(pool.available() + leased.len(), MAILBOX_POOL_SIZE);
        }
        for buffer in leased.drain(..) {
            pool.give_back(buffer).unwrap();
        }
        assert_eq!(pool.available(), MAILBOX_POOL_SIZE);
    }

    #[test]
    fn queue_entries_only_move_forward() {
        let mut pool = MailboxPool::new();
        let mut queue = MailboxQueue::default();
        let ticket = queue
            .enqueue(1, Some(pool.lease().unwrap()), Direction::Send, false, Duration::from_secs(1))
            .unwrap();
        assert_eq!(queue.state(ticket), Some(RequestState::Requested));
        assert!(queue.take_completed(ticket).is_none());

        let buffer = queue.checkout(ticket).unwrap();
        assert!(queue.complete(ticket, RequestState::Done, Some(buffer)).is_none());
        assert_eq!(queue.state(ticket), Some(RequestState::Done));

        // A completed request cannot fail afterwards
        assert!(queue.complete(ticket, RequestState::Failed, None).is_none());
        assert_eq!(queue.state(ticket), Some(RequestState::Done));

        let (state, buffer) = queue.take_completed(ticket).unwrap();
        assert_eq!(state, RequestState::Done);
        pool.give_back(buffer.unwrap()).unwrap();
        assert!(queue.is_empty());
    }

    #[test]
    fn tickets_stay_unique_across_reuse() {
        let mut queue = MailboxQueue::default();
        let mut seen = Vec::new();
        for _ in 0..100 {
            let ticket = queue
                .enqueue(1, None, Direction::Receive(MailboxType::CanopenOverEthercat), false, Duration::ZERO)
                .unwrap();
            assert!(!seen.contains(&ticket));
            seen.push(ticket);
            queue.cancel(ticket);
        }
    }

    #[test]
    fn full_queue_hands_back_the_buffer() {
        let mut pool = MailboxPool::new();
        let mut queue = MailboxQueue::default();
        for _ in 0..MAILBOX_POOL_SIZE {
            queue
                .enqueue(1, None, Direction::Receive(MailboxType::CanopenOverEthercat), false, Duration::ZERO)
                .unwrap();
        }
        let buffer = pool.lease().unwrap();
        let QueueFull(returned) = queue
            .enqueue(1, Some(buffer), Direction::Send, false, Duration::ZERO)
            .unwrap_err();
        pool.give_back(returned.unwrap()).unwrap();
    }

    #[test]
    fn removable_requests_are_reclaimed_on_completion() {
        let mut pool = MailboxPool::new();
        let mut queue = MailboxQueue::default();
        let ticket = queue
            .enqueue(1, Some(pool.lease().unwrap()), Direction::Send, true, Duration::from_secs(1))
            .unwrap();
        let buffer = queue.checkout(ticket).unwrap();
        let orphan = queue.complete(ticket, RequestState::Failed, Some(buffer)).unwrap();
        assert!(queue.is_empty());
        pool.give_back(orphan).unwrap();
    }
}
