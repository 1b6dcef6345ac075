use core::net::SocketAddrV4;

use embassy_net::udp::{BindError, PacketMetadata, SendError, UdpSocket};
use embassy_net::{IpAddress, IpEndpoint, Stack};
use spi_udp_bridge::chunk::DATAGRAM_MAX;
use spi_udp_bridge::forwarder::DatagramSink;
use static_cell::StaticCell;

/// Datagrams that may queue in the socket before `send_to` starts waiting.
const TX_DATAGRAMS: usize = 4;

static RX_META: StaticCell<[PacketMetadata; 1]> = StaticCell::new();
static TX_META: StaticCell<[PacketMetadata; TX_DATAGRAMS]> = StaticCell::new();
static RX_BUFFER: StaticCell<[u8; 64]> = StaticCell::new();
static TX_BUFFER: StaticCell<[u8; TX_DATAGRAMS * DATAGRAM_MAX]> = StaticCell::new();

/// Unconnected UDP socket on an ephemeral local port. Nothing is ever read from it.
pub struct UdpLink(UdpSocket<'static>);

impl UdpLink {
    /// Opens the socket. Can only be called once.
    pub fn bind(stack: Stack<'static>) -> Result<Self, BindError> {
        let mut socket = UdpSocket::new(
            stack,
            RX_META.init([PacketMetadata::EMPTY; 1]),
            RX_BUFFER.init([0; 64]),
            TX_META.init([PacketMetadata::EMPTY; TX_DATAGRAMS]),
            TX_BUFFER.init([0; TX_DATAGRAMS * DATAGRAM_MAX]),
        );
        socket.bind(0)?;
        Ok(Self(socket))
    }
}

impl DatagramSink for UdpLink {
    type Error = SendError;

    async fn send_to(
        &mut self,
        datagram: &[u8],
        destination: SocketAddrV4,
    ) -> Result<(), Self::Error> {
        let endpoint = IpEndpoint::new(IpAddress::Ipv4(*destination.ip()), destination.port());
        self.0.send_to(datagram, endpoint).await
    }
}
