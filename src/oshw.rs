//! Parent module for low level operations.

use num_traits::PrimInt;

pub mod nicdrv;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Network<Int: PrimInt>(Int);

impl<Int: PrimInt> Network<Int> {
    pub const fn into_inner(self) -> Int {
        self.0
    }
}

/// Host to network byte order (i.e. to big endian)
///
/// Note that EtherCAT uses little endian byte order, except for the Ethernet
/// header which is big endian as usual
pub fn host_to_network<Int: PrimInt>(host: Int) -> Network<Int> {
    Network(host.to_be())
}

/// Network (i.e. big endian) to host byte order.
pub fn network_to_host<Int: PrimInt>(network: Network<Int>) -> Int {
    Int::from_be(network.0)
}
