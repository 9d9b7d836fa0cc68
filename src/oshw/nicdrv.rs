//! EtherCAT frame buffers on top of a raw Ethernet link.
//!
//! The link itself (socket, redundant second port, driver) is provided by the
//! application through the [`Link`] trait. The [`Port`] owns the transmit and
//! receive buffers and hands out the frame index used to match a returning
//! frame with the request that sent it.

use std::{
    io,
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use log::trace;

use crate::{
    ethercat::{
        r#type::{
            BufferState, Buffer, EthernetHeader, BUFSIZE, ETHERCAT_INDEX_OFFSET,
            ETHERNET_HEADER_SIZE, MAX_BUF_COUNT, TIMEOUT_RETURN,
        },
        WriteTo,
    },
    osal::OsalTimer,
};

/// Primary MAC address, used as source address of every frame
pub const PRI_MAC: [u16; 3] = [0x0101, 0x0101, 0x0101];

/// Longest single receive attempt while waiting for a frame
const RECEIVE_POLL: Duration = Duration::from_micros(100);

#[derive(Debug, thiserror::Error)]
pub enum NicdrvError {
    /// No frame returned within the timeout
    #[error("no frame returned")]
    NoFrame,

    /// Every frame index is outstanding
    #[error("all {MAX_BUF_COUNT} frame indices are in use")]
    ExhaustedIndices,

    #[error("frame of {0} bytes does not fit a buffer")]
    FrameTooLarge(usize),

    #[error("malformed frame")]
    InvalidFrame,

    #[error("link failure")]
    Link(#[from] io::Error),
}

/// Raw Ethernet transport.
///
/// Implementations may duplicate traffic over a redundant second port; the
/// port only sees one logical stream of frames.
pub trait Link: Send + Sync {
    /// Transmit one complete Ethernet frame
    ///
    /// # Errors
    /// Returns an error if the frame could not be handed to the network
    fn send_frame(&self, frame: &[u8]) -> Result<(), NicdrvError>;

    /// Receive one Ethernet frame into `buffer`.
    ///
    /// Returns the frame length, or `None` if nothing arrived within `timeout`.
    ///
    /// # Errors
    /// Returns an error if the network failed
    fn receive_frame(
        &self,
        buffer: &mut [u8],
        timeout: Duration,
    ) -> Result<Option<usize>, NicdrvError>;
}

struct Buffers {
    state: [BufferState; MAX_BUF_COUNT],
    tx: [Buffer; MAX_BUF_COUNT],
    rx: [Buffer; MAX_BUF_COUNT],
    last_index: usize,
}

/// Frame buffers and index bookkeeping for one link
pub struct Port {
    link: Box<dyn Link>,
    buffers: Mutex<Buffers>,

    /// Temporary receive buffer, also serializes reading from the link
    temp_rx: Mutex<Box<[u8; BUFSIZE]>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // State behind the lock stays consistent when a holder panics
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Ethernet header every transmit buffer starts with
pub fn setup_header(buffer: &mut Buffer) {
    buffer.clear();
    let mut bytes = Vec::with_capacity(ETHERNET_HEADER_SIZE);
    if EthernetHeader::new(PRI_MAC).write_to(&mut bytes).is_ok() {
        // The header is far smaller than a buffer
        let _ = buffer.extend_from_slice(&bytes);
    }
}

impl Port {
    pub fn new(link: Box<dyn Link>) -> Self {
        let tx = std::array::from_fn(|_| {
            let mut buffer = Buffer::new();
            setup_header(&mut buffer);
            buffer
        });
        Self {
            link,
            buffers: Mutex::new(Buffers {
                state: [BufferState::Empty; MAX_BUF_COUNT],
                tx,
                rx: std::array::from_fn(|_| Buffer::new()),
                last_index: 0,
            }),
            temp_rx: Mutex::new(Box::new([0; BUFSIZE])),
        }
    }

    /// Get a new frame index, the round robin search starts after the last index handed out.
    ///
    /// # Errors
    /// Returns [`NicdrvError::ExhaustedIndices`] if all indices are outstanding
    pub fn get_index(&self) -> Result<u8, NicdrvError> {
        let mut buffers = lock(&self.buffers);
        let start = buffers.last_index;
        for offset in 1..=MAX_BUF_COUNT {
            let index = (start + offset) % MAX_BUF_COUNT;
            if buffers.state[index] == BufferState::Empty {
                buffers.state[index] = BufferState::Alloc;
                buffers.last_index = index;
                return Ok(index as u8);
            }
        }
        Err(NicdrvError::ExhaustedIndices)
    }

    /// Set the state of a frame buffer, [`BufferState::Empty`] releases its index
    pub fn set_buf_stat(&self, index: u8, state: BufferState) {
        if let Some(slot) = lock(&self.buffers).state.get_mut(usize::from(index)) {
            *slot = state;
        }
    }

    pub fn buf_stat(&self, index: u8) -> BufferState {
        lock(&self.buffers)
            .state
            .get(usize::from(index))
            .copied()
            .unwrap_or_default()
    }

    /// Let `f` edit the transmit buffer of `index`
    pub fn with_tx_buffer<T>(&self, index: u8, f: impl FnOnce(&mut Buffer) -> T) -> T {
        let mut buffers = lock(&self.buffers);
        f(&mut buffers.tx[usize::from(index) % MAX_BUF_COUNT])
    }

    /// Transmit the buffer of `index`, marking it as sent
    ///
    /// # Errors
    /// Returns an error if the link refused the frame
    pub fn out_frame(&self, index: u8) -> Result<(), NicdrvError> {
        let mut buffers = lock(&self.buffers);
        let slot = usize::from(index) % MAX_BUF_COUNT;
        buffers.state[slot] = BufferState::Tx;
        let result = self.link.send_frame(&buffers.tx[slot]);
        if result.is_err() {
            buffers.state[slot] = BufferState::Alloc;
        }
        trace!("frame {index} sent, {} bytes", buffers.tx[slot].len());
        result
    }

    /// One receive attempt for `index`.
    ///
    /// A frame returned for another outstanding index is stored for its owner.
    fn in_frame(&self, index: u8, timeout: Duration) -> Result<Option<Buffer>, NicdrvError> {
        let slot = usize::from(index) % MAX_BUF_COUNT;
        {
            let mut buffers = lock(&self.buffers);
            if buffers.state[slot] == BufferState::Rcvd {
                buffers.state[slot] = BufferState::Complete;
                return Ok(Some(buffers.rx[slot].clone()));
            }
        }

        let mut temp = lock(&self.temp_rx);
        let Some(length) = self.link.receive_frame(&mut temp[..], timeout)? else {
            return Ok(None);
        };
        if length <= ETHERCAT_INDEX_OFFSET || length > BUFSIZE {
            return Err(NicdrvError::InvalidFrame);
        }
        let received = usize::from(temp[ETHERCAT_INDEX_OFFSET]);
        let mut buffers = lock(&self.buffers);
        if received == slot {
            buffers.rx[slot].clear();
            let _ = buffers.rx[slot].extend_from_slice(&temp[..length]);
            buffers.state[slot] = BufferState::Complete;
            return Ok(Some(buffers.rx[slot].clone()));
        }
        if received < MAX_BUF_COUNT && buffers.state[received] == BufferState::Tx {
            buffers.rx[received].clear();
            let _ = buffers.rx[received].extend_from_slice(&temp[..length]);
            buffers.state[received] = BufferState::Rcvd;
        } else {
            trace!("dropped frame with unexpected index {received}");
        }
        Ok(None)
    }

    /// Wait for the frame of `index` to return.
    ///
    /// # Errors
    /// Returns [`NicdrvError::NoFrame`] if nothing returned within `timeout`
    pub fn wait_in_frame(&self, index: u8, timeout: Duration) -> Result<Buffer, NicdrvError> {
        let timer = OsalTimer::new(timeout);
        loop {
            if let Some(frame) = self.in_frame(index, timer.remaining().min(RECEIVE_POLL))? {
                return Ok(frame);
            }
            if timer.is_expired() {
                return Err(NicdrvError::NoFrame);
            }
        }
    }

    /// Send the frame of `index` and wait for it to return, resending when a
    /// single round trip times out.
    ///
    /// # Errors
    /// Returns [`NicdrvError::NoFrame`] if nothing returned within `timeout`
    pub fn src_confirm(&self, index: u8, timeout: Duration) -> Result<Buffer, NicdrvError> {
        let timer = OsalTimer::new(timeout);
        loop {
            self.out_frame(index)?;
            let round_trip = timer.remaining().min(TIMEOUT_RETURN);
            match self.wait_in_frame(index, round_trip) {
                Err(NicdrvError::NoFrame) if !timer.is_expired() => {}
                result => return result,
            }
        }
    }
}
