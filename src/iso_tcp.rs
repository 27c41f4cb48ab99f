//! Async ISO-on-TCP (RFC 1006 / COTP) transport for S7-family devices.
//!
//! Frames are TPKT-wrapped: a 4-byte header (version, reserved, length)
//! followed by COTP and the S7 payload. Connection setup is a COTP
//! connection request carrying local/remote TSAPs derived from the
//! connection type, rack and slot, followed by S7 PDU length negotiation.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::{GatewayError, GatewayResult};

/// Default ISO-TCP port.
pub const ISO_TCP_PORT: u16 = 102;

/// Largest frame we accept.
const MAX_FRAME: usize = 2084;

/// Requested S7 PDU length during negotiation.
const PDU_SIZE_REQUESTED: u16 = 480;

/// COTP connection-confirm PDU type.
const CONFIRM_CONNECTION: u8 = 0xD0;

/// Client connection type; priority-ordered, 16 hardware slots total.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionType {
    /// Programming-device connection.
    Pg = 1,
    /// Operator-panel connection.
    Op = 2,
    /// Generic data connection (also used for DP slaves).
    Basic = 3,
}

/// ISO connection request telegram (TPKT + COTP). TSAP bytes 16/17 and
/// 20/21 are patched in before sending.
const ISO_CONNECTION_REQUEST: [u8; 22] = [
    3,   // RFC 1006 version
    0,   // reserved
    0,   // frame length high
    22,  // frame length low
    17,  // COTP length
    224, // CR, connection request
    0, 0, // destination reference
    0, 1, // source reference
    0,   // class + options
    192, // PDU max length parameter
    1,   // parameter length
    10,  // PDU max length (2^10)
    193, // src TSAP parameter
    2,   // length
    1, 0, // src TSAP (patched)
    194, // dst TSAP parameter
    2,   // length
    1, 2, // dst TSAP (patched)
];

/// S7 PDU length negotiation telegram; requested length patched at 23..25.
const PDU_NEGOTIATION: [u8; 25] = [
    3, 0, 0, 25, 2, 240, 128, // TPKT + COTP
    50, 1, 0, 0, 4, 0, 0, 8, 0, 0, 240, 0, 0, 1, 0, 1, 0, 30,
];

/// Async ISO-on-TCP transport.
pub struct IsoTcpTransport {
    stream: TcpStream,
    timeout: Duration,
    /// Negotiated PDU length; set during connect.
    pdu_length: u16,
}

impl IsoTcpTransport {
    /// Connect, perform the COTP handshake and negotiate the PDU length.
    pub async fn connect(
        host: &str,
        port: u16,
        rack: u16,
        slot: u16,
        conn_type: ConnectionType,
        timeout: Duration,
    ) -> GatewayResult<Self> {
        let addr = format!("{}:{}", host, port);
        let stream = tokio::time::timeout(timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| GatewayError::timeout("connect", timeout.as_millis() as u64))?
            .map_err(|e| GatewayError::connection(format!("TCP connect to {}: {}", addr, e)))?;
        stream.set_nodelay(true).ok();

        let mut transport = IsoTcpTransport {
            stream,
            timeout,
            pdu_length: 0,
        };
        transport.iso_connect(rack, slot, conn_type).await?;
        transport.negotiate_pdu_length().await?;
        Ok(transport)
    }

    /// Negotiated PDU length in bytes.
    pub fn pdu_length(&self) -> u16 {
        self.pdu_length
    }

    /// TSAP pair for a connection type, rack and slot.
    fn tsap(rack: u16, slot: u16, conn_type: ConnectionType) -> (u16, u16) {
        let local = 0x0100;
        let remote = ((conn_type as u16) << 8) + rack * 0x20 + slot;
        (local, remote)
    }

    async fn iso_connect(
        &mut self,
        rack: u16,
        slot: u16,
        conn_type: ConnectionType,
    ) -> GatewayResult<()> {
        let (local, remote) = Self::tsap(rack, slot, conn_type);
        let mut msg = ISO_CONNECTION_REQUEST.to_vec();
        msg[16] = (local >> 8) as u8;
        msg[17] = (local & 0xFF) as u8;
        msg[20] = (remote >> 8) as u8;
        msg[21] = (remote & 0xFF) as u8;

        let response = self.exchange(&msg).await?;
        if response.len() < 6 || response[5] != CONFIRM_CONNECTION {
            return Err(GatewayError::protocol(
                "ISO connection request was not confirmed",
            ));
        }
        debug!(rack, slot, "ISO-on-TCP connection confirmed");
        Ok(())
    }

    async fn negotiate_pdu_length(&mut self) -> GatewayResult<()> {
        let mut msg = PDU_NEGOTIATION.to_vec();
        msg[23] = (PDU_SIZE_REQUESTED >> 8) as u8;
        msg[24] = (PDU_SIZE_REQUESTED & 0xFF) as u8;

        let response = self.exchange(&msg).await?;
        if response.len() != 27 || response[17] != 0 || response[18] != 0 {
            return Err(GatewayError::protocol("PDU length negotiation rejected"));
        }
        let negotiated = u16::from_be_bytes([response[25], response[26]]);
        if negotiated == 0 {
            return Err(GatewayError::protocol("Peer negotiated a zero PDU length"));
        }
        self.pdu_length = negotiated;
        debug!(pdu_length = negotiated, "PDU length negotiated");
        Ok(())
    }

    /// Send one telegram and receive the next data frame.
    ///
    /// The returned buffer includes the TPKT and COTP headers, matching
    /// the byte offsets the S7 telegram layouts are defined against.
    pub async fn exchange(&mut self, request: &[u8]) -> GatewayResult<Vec<u8>> {
        let timeout = self.timeout;
        tokio::time::timeout(timeout, self.exchange_inner(request))
            .await
            .map_err(|_| GatewayError::timeout("exchange", timeout.as_millis() as u64))?
    }

    async fn exchange_inner(&mut self, request: &[u8]) -> GatewayResult<Vec<u8>> {
        self.stream.write_all(request).await?;

        loop {
            // TPKT header: version, reserved, length (big-endian).
            let mut tpkt = [0u8; 4];
            self.stream.read_exact(&mut tpkt).await?;
            let length = u16::from_be_bytes([tpkt[2], tpkt[3]]) as usize;

            if length < 7 || length > MAX_FRAME {
                return Err(GatewayError::protocol(format!(
                    "Invalid TPKT frame length {}",
                    length
                )));
            }

            let mut frame = vec![0u8; length];
            frame[..4].copy_from_slice(&tpkt);
            self.stream.read_exact(&mut frame[4..]).await?;

            // A 7-byte frame is a bare COTP keep-alive; wait for data.
            if length == 7 && frame[5] != CONFIRM_CONNECTION {
                continue;
            }
            return Ok(frame);
        }
    }

    /// Close the underlying stream.
    pub async fn close(&mut self) -> GatewayResult<()> {
        self.stream.shutdown().await.ok();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tsap_derivation() {
        // PG connection, rack 0 slot 2 — the common S7-300 arrangement.
        let (local, remote) = IsoTcpTransport::tsap(0, 2, ConnectionType::Pg);
        assert_eq!(local, 0x0100);
        assert_eq!(remote, 0x0102);

        // OP connection, rack 1 slot 3.
        let (_, remote) = IsoTcpTransport::tsap(1, 3, ConnectionType::Op);
        assert_eq!(remote, 0x0223);
    }

    #[test]
    fn test_connection_request_layout() {
        assert_eq!(ISO_CONNECTION_REQUEST.len(), 22);
        assert_eq!(ISO_CONNECTION_REQUEST[0], 3); // RFC1006
        assert_eq!(ISO_CONNECTION_REQUEST[3], 22); // frame length
        assert_eq!(ISO_CONNECTION_REQUEST[5], 224); // CR
    }

    #[tokio::test]
    async fn test_connect_refused_maps_to_connection_error() {
        let result = IsoTcpTransport::connect(
            "127.0.0.1",
            1, // nothing listens here
            0,
            2,
            ConnectionType::Pg,
            Duration::from_millis(500),
        )
        .await;
        assert!(matches!(
            result,
            Err(GatewayError::Connection { .. }) | Err(GatewayError::Timeout { .. })
        ));
    }
}
