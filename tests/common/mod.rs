//! Simulated EtherCAT segment.
//!
//! A line of slaves answering frames from memory: every slave owns a register
//! file, processes datagrams the way an ESC does and loops the frame back. The
//! AL state machine, FMMUs, mailbox sync managers with a small SDO server and
//! the DC receive time latch are modelled, enough to drive the master through
//! configuration, cyclic exchange and recovery.

#![allow(dead_code)]

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use soem_core::{
    ethercat::config::{MailboxDescription, ProcessDataDescription, SlaveDescription},
    oshw::nicdrv::{Link, NicdrvError},
};

pub const OUTPUTS_ADDRESS: u16 = 0x1100;
pub const INPUTS_ADDRESS: u16 = 0x1180;
pub const MAILBOX_WRITE_ADDRESS: u16 = 0x1000;
pub const MAILBOX_READ_ADDRESS: u16 = 0x1080;
pub const MAILBOX_LENGTH: u16 = 128;

/// Link delay between neighbouring slaves, in nanoseconds
pub const LINK_DELAY: u32 = 100;

const MEMORY_SIZE: usize = 0x2000;
const DATAGRAMS_OFFSET: usize = 16;
const DATAGRAM_HEADER_SIZE: usize = 10;

const AL_CONTROL: usize = 0x120;
const AL_STATUS: usize = 0x130;
const AL_STATUS_CODE: usize = 0x134;

/// Frames after an AL control write until the AL status follows
const AL_SWITCH_FRAMES: u8 = 2;
const DC_LATCH: usize = 0x900;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Description of a slave with `output_bits` and `input_bits` of process data
pub fn io_description(product: u32, output_bits: u16, input_bits: u16) -> SlaveDescription {
    SlaveDescription {
        manufacturer: 2,
        product,
        revision: 1,
        serial: u32::from(output_bits) << 16 | u32::from(input_bits),
        name: format!("IO {output_bits}/{input_bits}"),
        outputs: (output_bits > 0).then_some(ProcessDataDescription {
            start_address: OUTPUTS_ADDRESS,
            bits: output_bits,
        }),
        inputs: (input_bits > 0).then_some(ProcessDataDescription {
            start_address: INPUTS_ADDRESS,
            bits: input_bits,
        }),
        ..SlaveDescription::default()
    }
}

/// Description of a CoE slave with the standard mailbox layout
pub fn mailbox_description(product: u32, output_bits: u16, input_bits: u16) -> SlaveDescription {
    SlaveDescription {
        mailbox: Some(MailboxDescription {
            write_offset: MAILBOX_WRITE_ADDRESS,
            write_length: MAILBOX_LENGTH,
            read_offset: MAILBOX_READ_ADDRESS,
            read_length: MAILBOX_LENGTH,
            protocols: 4,
        }),
        ..io_description(product, output_bits, input_bits)
    }
}

/// One simulated slave
#[derive(Debug, Clone)]
pub struct SimSlave {
    memory: Vec<u8>,
    alias: u16,
    esc_type: u16,
    dc: bool,
    present: bool,

    /// Local clock at the start of the simulation
    clock_base: u64,
    objects: HashMap<(u16, u8), Vec<u8>>,
    read_only: Vec<(u16, u8)>,
    reply: Option<Vec<u8>>,
    last_reply: Option<Vec<u8>>,

    /// Counter of the mailboxes sent by the slave, 1..7
    mailbox_counter: u8,

    /// AL status taking effect after some frames, and the frames left
    pending_status: Option<(u16, u8)>,

    /// State that is refused with an error and its AL status code
    refuse: Option<(u16, u16)>,
}

impl SimSlave {
    pub fn new(esc_type: u16) -> Self {
        let mut slave = Self {
            memory: vec![0; MEMORY_SIZE],
            alias: 0,
            esc_type,
            dc: false,
            present: true,
            clock_base: 0,
            objects: HashMap::new(),
            read_only: Vec::new(),
            reply: None,
            last_reply: None,
            mailbox_counter: 0,
            pending_status: None,
            refuse: None,
        };
        slave.power_up();
        slave
    }

    pub fn with_alias(mut self, alias: u16) -> Self {
        self.alias = alias;
        self.power_up();
        self
    }

    /// DC capable slave whose local clock starts at `clock_base`
    pub fn with_dc(mut self, clock_base: u64) -> Self {
        self.dc = true;
        self.clock_base = clock_base;
        self.power_up();
        self
    }

    pub fn with_object(mut self, index: u16, sub_index: u8, value: &[u8]) -> Self {
        self.objects.insert((index, sub_index), value.to_vec());
        self
    }

    pub fn with_read_only_object(mut self, index: u16, sub_index: u8, value: &[u8]) -> Self {
        self.read_only.push((index, sub_index));
        self.with_object(index, sub_index, value)
    }

    /// Registers as found after power on: no station address, INIT
    fn power_up(&mut self) {
        self.memory.fill(0);
        self.memory[0..2].copy_from_slice(&self.esc_type.to_le_bytes());
        self.memory[0x12..0x14].copy_from_slice(&self.alias.to_le_bytes());
        let features: u16 = if self.dc { 0x04 } else { 0 };
        self.memory[0x08..0x0A].copy_from_slice(&features.to_le_bytes());
        self.memory[AL_STATUS] = 1;
        self.pending_status = None;
        self.reset_mailbox();
    }

    fn reset_mailbox(&mut self) {
        self.reply = None;
        self.last_reply = None;
        self.mailbox_counter = 0;
    }

    /// Queue a mailbox for the master, stamped with the next counter
    fn send_mailbox(&mut self, mut message: Vec<u8>) {
        self.mailbox_counter = self.mailbox_counter % 7 + 1;
        message[5] = message[5] & 0x0F | self.mailbox_counter << 4;
        self.last_reply = Some(message.clone());
        self.reply = Some(message);
    }

    fn word(&self, address: usize) -> u16 {
        u16::from_le_bytes([self.memory[address], self.memory[address + 1]])
    }

    fn set_word(&mut self, address: usize, value: u16) {
        self.memory[address..address + 2].copy_from_slice(&value.to_le_bytes());
    }

    fn station_address(&self) -> u16 {
        self.word(0x10)
    }

    /// Start address of sync manager `index`, `None` while it has no length
    fn sync_manager_start(&self, index: usize) -> Option<usize> {
        let base = 0x800 + index * 8;
        (self.word(base + 2) > 0).then(|| usize::from(self.word(base)))
    }

    /// Refresh the registers the ESC updates on its own
    fn refresh(&mut self, position: usize, count: usize, clock: u64) {
        match self.pending_status {
            Some((status, 0 | 1)) => {
                self.pending_status = None;
                self.set_word(AL_STATUS, status);
                if status & 0x0F == 1 {
                    self.reset_mailbox();
                }
            }
            Some((status, frames)) => self.pending_status = Some((status, frames - 1)),
            None => {}
        }
        let last = position + 1 == count;
        let dl_status: u16 = 0x5000 | 0x0210 | if last { 0x0400 } else { 0x0820 };
        self.set_word(0x110, dl_status);
        self.memory[0x805] = 0;
        self.memory[0x80D] = if self.reply.is_some() { 0x08 } else { 0 };
        if self.dc {
            let offset = u64::from_le_bytes(self.bytes::<8>(0x920));
            let time = self.clock_base.wrapping_add(clock).wrapping_add(offset);
            self.memory[0x910..0x918].copy_from_slice(&time.to_le_bytes());
        }
    }

    fn bytes<const N: usize>(&self, address: usize) -> [u8; N] {
        let mut bytes = [0; N];
        bytes.copy_from_slice(&self.memory[address..address + N]);
        bytes
    }

    fn read(&self, address: usize, data: &mut [u8]) {
        for (offset, byte) in data.iter_mut().enumerate() {
            if let Some(&value) = self.memory.get(address + offset) {
                *byte = value;
            }
        }
    }

    fn read_or(&self, address: usize, data: &mut [u8]) {
        for (offset, byte) in data.iter_mut().enumerate() {
            if let Some(&value) = self.memory.get(address + offset) {
                *byte |= value;
            }
        }
    }

    fn write(&mut self, address: usize, data: &[u8], position: usize, count: usize, clock: u64) {
        for (offset, &byte) in data.iter().enumerate() {
            if let Some(target) = self.memory.get_mut(address + offset) {
                *target = byte;
            }
        }
        let end = address + data.len();
        if address <= AL_CONTROL && end > AL_CONTROL {
            self.control(self.word(AL_CONTROL));
        }
        if address == DC_LATCH && self.dc {
            self.latch(position, count, clock);
        }
        if Some(address) == self.sync_manager_start(0) {
            self.serve_mailbox(data);
        }
    }

    /// Register read from the master, `false` if the ESC refuses it
    fn read_register(&mut self, address: usize, data: &mut [u8]) -> bool {
        if Some(address) == self.sync_manager_start(1) {
            let Some(reply) = self.reply.take() else {
                return false;
            };
            let length = reply.len().min(data.len());
            self.memory[address..address + length].copy_from_slice(&reply[..length]);
        }
        self.read(address, data);
        true
    }

    /// AL control written, the AL status follows two frames later
    fn control(&mut self, control: u16) {
        let requested = control & 0x0F;
        let ack = control & 0x10 != 0;
        let status = self.pending_status.map_or_else(|| self.word(AL_STATUS), |(status, _)| status);
        let current = status & 0x0F;
        let mut error = status & 0x10 != 0;
        if ack {
            error = false;
            self.set_word(AL_STATUS_CODE, 0);
        }
        if error && requested > current {
            return;
        }
        if !matches!(requested, 1 | 2 | 3 | 4 | 8) {
            self.switch_to(current | 0x10);
            self.set_word(AL_STATUS_CODE, 0x0011);
            return;
        }
        if let Some((state, code)) = self.refuse {
            if state == requested {
                self.switch_to(current | 0x10);
                self.set_word(AL_STATUS_CODE, code);
                return;
            }
        }
        self.switch_to(requested | if error { 0x10 } else { 0 });
    }

    fn switch_to(&mut self, status: u16) {
        self.pending_status = Some((status, AL_SWITCH_FRAMES));
    }

    /// Latch the receive times of the ports for a frame passing a line of `count`
    fn latch(&mut self, position: usize, count: usize, clock: u64) {
        let position = position as u32;
        let last = count as u32 - 1;
        let local = self.clock_base.wrapping_add(clock) as u32;
        let port0 = local.wrapping_add(position * LINK_DELAY);
        let port1 = if position < last {
            local.wrapping_add((2 * last - position) * LINK_DELAY)
        } else {
            0
        };
        self.memory[0x900..0x910].fill(0);
        self.memory[0x900..0x904].copy_from_slice(&port0.to_le_bytes());
        self.memory[0x904..0x908].copy_from_slice(&port1.to_le_bytes());
        let processing_unit = self.clock_base.wrapping_add(clock) + u64::from(position * LINK_DELAY);
        self.memory[0x918..0x920].copy_from_slice(&processing_unit.to_le_bytes());
    }

    /// Answer a CoE SDO request written to the write mailbox
    fn serve_mailbox(&mut self, request: &[u8]) {
        if request.len() < 16 || request[5] & 0x0F != 3 || u16::from_le_bytes([request[6], request[7]]) >> 12 != 2 {
            return;
        }
        let command = request[8];
        let index = u16::from_le_bytes([request[9], request[10]]);
        let sub_index = request[11];
        let data = &request[12..];

        let mut payload = Vec::new();
        let (service, command): (u16, u8) = match command & 0xE0 {
            0x40 => match self.objects.get(&(index, sub_index)) {
                Some(value) if value.len() <= 4 => {
                    payload.extend_from_slice(value);
                    payload.resize(4, 0);
                    (3, 0x43 | ((4 - value.len() as u8) << 2))
                }
                Some(value) => {
                    payload.extend_from_slice(&(value.len() as u32).to_le_bytes());
                    payload.extend_from_slice(value);
                    (3, 0x41)
                }
                None => {
                    payload.extend_from_slice(&0x0602_0000_u32.to_le_bytes());
                    (2, 0x80)
                }
            },
            0x20 => {
                let value = if command & 0x02 != 0 {
                    let unused = if command & 0x01 != 0 { usize::from(command >> 2 & 3) } else { 0 };
                    data[..4 - unused].to_vec()
                } else {
                    let size = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
                    data[4..4 + size].to_vec()
                };
                if self.read_only.contains(&(index, sub_index)) {
                    payload.extend_from_slice(&0x0601_0002_u32.to_le_bytes());
                    (2, 0x80)
                } else {
                    self.objects.insert((index, sub_index), value);
                    payload.resize(4, 0);
                    (3, 0x60)
                }
            }
            _ => return,
        };

        let mut reply = Vec::with_capacity(12 + payload.len());
        reply.extend_from_slice(&(6 + payload.len() as u16).to_le_bytes());
        reply.extend_from_slice(&[0, 0, 0, 3]);
        reply.extend_from_slice(&(service << 12).to_le_bytes());
        reply.push(command);
        reply.extend_from_slice(&index.to_le_bytes());
        reply.push(sub_index);
        reply.extend_from_slice(&payload);
        self.send_mailbox(reply);
    }

    /// Apply the active FMMUs to a logical datagram, returning whether a
    /// reading and whether a writing FMMU matched
    fn logical(&mut self, address: u64, data: &mut [u8], read: bool, write: bool) -> (bool, bool) {
        let mut hits = (false, false);
        let datagram_bits = address * 8..(address + data.len() as u64) * 8;
        // Outputs are taken from the incoming frame before inputs are inserted
        for wanted in [2, 1] {
            if (wanted == 2 && !write) || (wanted == 1 && !read) {
                continue;
            }
            for fmmu in 0..16 {
                let base = 0x600 + fmmu * 16;
                let entry = self.bytes::<16>(base);
                if entry[12] == 0 || entry[11] != wanted {
                    continue;
                }
                let log_start = u64::from(u32::from_le_bytes([entry[0], entry[1], entry[2], entry[3]]));
                let log_length = u64::from(u16::from_le_bytes([entry[4], entry[5]]));
                if log_length == 0 {
                    continue;
                }
                let first = log_start * 8 + u64::from(entry[6]);
                let last = (log_start + log_length - 1) * 8 + u64::from(entry[7]);
                let physical = u64::from(u16::from_le_bytes([entry[8], entry[9]])) * 8 + u64::from(entry[10]);

                let from = first.max(datagram_bits.start);
                let to = (last + 1).min(datagram_bits.end);
                if from >= to {
                    continue;
                }
                for bit in from..to {
                    let datagram_bit = (bit - datagram_bits.start) as usize;
                    let memory_bit = (physical + bit - first) as usize;
                    if memory_bit / 8 >= self.memory.len() {
                        continue;
                    }
                    if wanted == 2 {
                        let value = data[datagram_bit / 8] >> (datagram_bit % 8) & 1;
                        let byte = &mut self.memory[memory_bit / 8];
                        *byte = *byte & !(1 << (memory_bit % 8)) | value << (memory_bit % 8);
                    } else {
                        let value = self.memory[memory_bit / 8] >> (memory_bit % 8) & 1;
                        let byte = &mut data[datagram_bit / 8];
                        *byte = *byte & !(1 << (datagram_bit % 8)) | value << (datagram_bit % 8);
                    }
                }
                if wanted == 2 {
                    hits.1 = true;
                } else {
                    hits.0 = true;
                }
            }
        }
        hits
    }
}

#[derive(Debug, Default)]
struct Segment {
    slaves: Vec<SimSlave>,

    /// Simulated time in nanoseconds, advancing with every frame
    clock: u64,
    frames: usize,
}

impl Segment {
    fn present(&self) -> Vec<usize> {
        self.slaves
            .iter()
            .enumerate()
            .filter(|(_, slave)| slave.present)
            .map(|(index, _)| index)
            .collect()
    }

    fn process_frame(&mut self, frame: &mut [u8]) {
        self.clock += 1_000;
        self.frames += 1;
        let present = self.present();
        for (position, &index) in present.iter().enumerate() {
            self.slaves[index].refresh(position, present.len(), self.clock);
        }

        let mut offset = DATAGRAMS_OFFSET;
        while offset + DATAGRAM_HEADER_SIZE <= frame.len() {
            let header = &frame[offset..offset + DATAGRAM_HEADER_SIZE];
            let command = header[0];
            let mut adp = u16::from_le_bytes([header[2], header[3]]);
            let ado = u16::from_le_bytes([header[4], header[5]]);
            let length_word = u16::from_le_bytes([header[6], header[7]]);
            let length = usize::from(length_word & 0x07FF);
            let data_start = offset + DATAGRAM_HEADER_SIZE;
            if data_start + length + 2 > frame.len() {
                return;
            }
            let (data, rest) = frame[data_start..].split_at_mut(length);
            let mut wkc = u16::from_le_bytes([rest[0], rest[1]]);

            for (position, &index) in present.iter().enumerate() {
                let count = present.len();
                let clock = self.clock;
                let slave = &mut self.slaves[index];
                let address = usize::from(ado);
                match command {
                    // APRD, APWR
                    1 | 2 => {
                        if adp == 0 {
                            if command == 1 {
                                if slave.read_register(address, data) {
                                    wkc += 1;
                                }
                            } else {
                                slave.write(address, data, position, count, clock);
                                wkc += 1;
                            }
                        }
                        adp = adp.wrapping_add(1);
                    }
                    // FPRD, FPWR
                    4 | 5 if slave.station_address() == adp => {
                        if command == 4 {
                            if slave.read_register(address, data) {
                                wkc += 1;
                            }
                        } else {
                            slave.write(address, data, position, count, clock);
                            wkc += 1;
                        }
                    }
                    // BRD
                    7 => {
                        slave.read_or(address, data);
                        wkc += 1;
                    }
                    // BWR
                    8 => {
                        slave.write(address, data, position, count, clock);
                        wkc += 1;
                    }
                    // LRD, LWR, LRW
                    10..=12 => {
                        let logical = u64::from(adp) | u64::from(ado) << 16;
                        let (read, write) = slave.logical(logical, data, command != 11, command != 10);
                        if read {
                            wkc += 1;
                        }
                        if write {
                            wkc += if command == 12 { 2 } else { 1 };
                        }
                    }
                    // FRMW
                    14 => {
                        if slave.station_address() == adp {
                            slave.read(address, data);
                        } else {
                            slave.write(address, data, position, count, clock);
                        }
                        wkc += 1;
                    }
                    _ => {}
                }
            }
            frame[data_start - DATAGRAM_HEADER_SIZE + 2..data_start - DATAGRAM_HEADER_SIZE + 4]
                .copy_from_slice(&adp.to_le_bytes());
            frame[data_start + length..data_start + length + 2].copy_from_slice(&wkc.to_le_bytes());

            if length_word & 0x8000 == 0 {
                break;
            }
            offset = data_start + length + 2;
        }
    }
}

struct Shared {
    segment: Mutex<Segment>,
    replies: Mutex<VecDeque<Vec<u8>>>,
    returned: Condvar,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle on a simulated segment, clones share the segment
#[derive(Clone)]
pub struct SimBus(Arc<Shared>);

impl SimBus {
    pub fn new(slaves: Vec<SimSlave>) -> Self {
        Self(Arc::new(Shared {
            segment: Mutex::new(Segment {
                slaves,
                ..Segment::default()
            }),
            replies: Mutex::new(VecDeque::new()),
            returned: Condvar::new(),
        }))
    }

    /// Link to hand to the master
    pub fn link(&self) -> Box<dyn Link> {
        Box::new(self.clone())
    }

    fn with_slave<T>(&self, slave: u16, f: impl FnOnce(&mut SimSlave) -> T) -> T {
        let mut segment = lock(&self.0.segment);
        f(&mut segment.slaves[usize::from(slave) - 1])
    }

    /// Bytes of the memory of the slave at bus position `slave`, counting from 1
    pub fn memory(&self, slave: u16, address: u16, length: usize) -> Vec<u8> {
        self.with_slave(slave, |entry| {
            let start = usize::from(address);
            entry.memory[start..start + length].to_vec()
        })
    }

    pub fn set_memory(&self, slave: u16, address: u16, bytes: &[u8]) {
        self.with_slave(slave, |entry| {
            let start = usize::from(address);
            entry.memory[start..start + bytes.len()].copy_from_slice(bytes);
        });
    }

    pub fn word(&self, slave: u16, address: u16) -> u16 {
        self.with_slave(slave, |entry| entry.word(usize::from(address)))
    }

    pub fn long(&self, slave: u16, address: u16) -> u64 {
        self.with_slave(slave, |entry| u64::from_le_bytes(entry.bytes::<8>(usize::from(address))))
    }

    pub fn outputs(&self, slave: u16, length: usize) -> Vec<u8> {
        self.memory(slave, OUTPUTS_ADDRESS, length)
    }

    pub fn set_inputs(&self, slave: u16, bytes: &[u8]) {
        self.set_memory(slave, INPUTS_ADDRESS, bytes);
    }

    /// AL status the slave is in or switching to
    pub fn al_status(&self, slave: u16) -> u16 {
        self.with_slave(slave, |entry| entry.pending_status.map_or_else(|| entry.word(AL_STATUS), |(status, _)| status))
    }

    /// Force the AL status, as a slave detecting a local error does
    pub fn set_al_status(&self, slave: u16, status: u16, code: u16) {
        self.with_slave(slave, |entry| {
            entry.pending_status = None;
            entry.set_word(AL_STATUS, status);
            entry.set_word(AL_STATUS_CODE, code);
        });
    }

    /// Make the slave refuse `state` with an error and `code`
    pub fn refuse_state(&self, slave: u16, state: u16, code: u16) {
        self.with_slave(slave, |entry| entry.refuse = Some((state, code)));
    }

    pub fn object(&self, slave: u16, index: u16, sub_index: u8) -> Option<Vec<u8>> {
        self.with_slave(slave, |entry| entry.objects.get(&(index, sub_index)).cloned())
    }

    /// Put a CoE emergency into the read mailbox of a slave
    pub fn emergency(&self, slave: u16, error_code: u16, error_register: u8) {
        let mut message = vec![10, 0, 0, 0, 0, 3];
        message.extend_from_slice(&(1_u16 << 12).to_le_bytes());
        message.extend_from_slice(&error_code.to_le_bytes());
        message.extend_from_slice(&[error_register, 0, 0, 0, 0, 0]);
        self.with_slave(slave, |entry| entry.send_mailbox(message));
    }

    /// Send the last mailbox of a slave again with its counter unchanged, as a
    /// slave repeating a mailbox the master did not take does
    pub fn repeat_mailbox(&self, slave: u16) {
        self.with_slave(slave, |entry| entry.reply = entry.last_reply.clone());
    }

    /// Unplug a slave, frames pass it by
    pub fn disconnect(&self, slave: u16) {
        self.with_slave(slave, |entry| entry.present = false);
    }

    /// Plug a slave back in after a power cycle
    pub fn reconnect(&self, slave: u16) {
        self.with_slave(slave, |entry| {
            entry.power_up();
            entry.present = true;
        });
    }

    pub fn frames(&self) -> usize {
        lock(&self.0.segment).frames
    }
}

impl Link for SimBus {
    fn send_frame(&self, frame: &[u8]) -> Result<(), NicdrvError> {
        let mut reply = frame.to_vec();
        lock(&self.0.segment).process_frame(&mut reply);
        lock(&self.0.replies).push_back(reply);
        self.0.returned.notify_all();
        Ok(())
    }

    fn receive_frame(&self, buffer: &mut [u8], timeout: Duration) -> Result<Option<usize>, NicdrvError> {
        let replies = lock(&self.0.replies);
        let (mut replies, _) = self
            .0
            .returned
            .wait_timeout_while(replies, timeout, |replies| replies.is_empty())
            .unwrap_or_else(PoisonError::into_inner);
        let Some(frame) = replies.pop_front() else {
            return Ok(None);
        };
        let length = frame.len().min(buffer.len());
        buffer[..length].copy_from_slice(&frame[..length]);
        Ok(Some(length))
    }
}
