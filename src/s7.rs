//! S7comm client over ISO-on-TCP.
//!
//! Implements the minimum of the S7 protocol family needed to poll data
//! blocks: a COTP connection request with the rack/slot-derived TSAP, the
//! Setup Communication exchange that negotiates the PDU size, and Read Var
//! requests against DB byte areas. Framing is TPKT (RFC 1006): a 4-byte
//! header carrying the total frame length, then COTP and the S7 PDU.
//!
//! The frame builders and parsers are plain functions over byte slices so
//! they can be tested against fixture frames without a controller.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use crate::config::TargetConfig;
use crate::transport::{Connection, Transport, TransportError};

/// Default timeout for establishing a connection.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// PDU size we request during Setup Communication. The controller may
/// negotiate it down; reads are bounded by the negotiated value.
const REQUESTED_PDU_SIZE: u16 = 480;

/// Upper bound on an incoming TPKT frame; anything larger is a framing
/// error, not a legitimate response to our small reads.
const MAX_FRAME_SIZE: usize = 8192;

/// Response overhead of a Read Var ack (COTP + S7 header + item header).
const READ_RESPONSE_OVERHEAD: usize = 18;

const TPKT_VERSION: u8 = 0x03;
const COTP_CONNECT_CONFIRM: u8 = 0xD0;
const S7_PROTOCOL_ID: u8 = 0x32;
const ROSCTR_JOB: u8 = 0x01;
const ROSCTR_ACK_DATA: u8 = 0x03;
const FUNC_SETUP: u8 = 0xF0;
const FUNC_READ_VAR: u8 = 0x04;
const AREA_DB: u8 = 0x84;
const TRANSPORT_SIZE_BYTE: u8 = 0x02;
const RETURN_OK: u8 = 0xFF;

/// Transport over S7comm / ISO-on-TCP.
pub struct S7Transport {
    connect_timeout: Duration,
}

impl S7Transport {
    /// Create a transport with the given connect timeout.
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for S7Transport {
    fn default() -> Self {
        Self::new(DEFAULT_CONNECT_TIMEOUT)
    }
}

impl Transport for S7Transport {
    type Connection = S7Connection;

    async fn connect(&self, target: &TargetConfig) -> Result<S7Connection, TransportError> {
        let addr = format!("{}:{}", target.ip, target.port);

        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| TransportError::Connect {
                addr: addr.clone(),
                reason: "connection timeout".to_string(),
            })?
            .map_err(|e| TransportError::Connect {
                addr: addr.clone(),
                reason: e.to_string(),
            })?;

        let mut conn = S7Connection {
            stream,
            pdu_ref: 0,
            max_pdu: REQUESTED_PDU_SIZE,
        };

        conn.handshake(target.rack, target.slot)
            .await
            .map_err(|e| TransportError::Connect {
                addr: addr.clone(),
                reason: e.to_string(),
            })?;

        debug!(
            "Connected to {} (negotiated PDU size {})",
            addr, conn.max_pdu
        );
        Ok(conn)
    }
}

/// An established S7 session.
pub struct S7Connection {
    stream: TcpStream,
    pdu_ref: u16,
    max_pdu: u16,
}

impl S7Connection {
    /// COTP connection request plus Setup Communication.
    async fn handshake(&mut self, rack: u16, slot: u16) -> Result<(), TransportError> {
        let response = self.request(&cotp_connect_request(rack, slot)).await?;
        parse_connect_confirm(&response)?;

        let pdu_ref = self.next_ref();
        let response = self.request(&setup_request(pdu_ref)).await?;
        self.max_pdu = parse_setup_response(&response)?;
        Ok(())
    }

    /// Send one frame and read one frame back.
    async fn request(&mut self, frame: &[u8]) -> Result<Vec<u8>, TransportError> {
        self.stream.write_all(frame).await?;
        self.read_frame().await
    }

    /// Read a TPKT frame and return its payload (COTP onward).
    async fn read_frame(&mut self) -> Result<Vec<u8>, TransportError> {
        let mut header = [0u8; 4];
        self.stream.read_exact(&mut header).await?;

        if header[0] != TPKT_VERSION {
            return Err(TransportError::Protocol(format!(
                "unexpected TPKT version 0x{:02X}",
                header[0]
            )));
        }

        let total = u16::from_be_bytes([header[2], header[3]]) as usize;
        if !(7..=MAX_FRAME_SIZE).contains(&total) {
            return Err(TransportError::Protocol(format!(
                "implausible frame length {}",
                total
            )));
        }

        let mut payload = vec![0u8; total - 4];
        self.stream.read_exact(&mut payload).await?;
        Ok(payload)
    }

    fn next_ref(&mut self) -> u16 {
        self.pdu_ref = self.pdu_ref.wrapping_add(1);
        self.pdu_ref
    }
}

impl Connection for S7Connection {
    async fn read(&mut self, db: u16, offset: u32, len: usize) -> Result<Vec<u8>, TransportError> {
        let max_read = (self.max_pdu as usize).saturating_sub(READ_RESPONSE_OVERHEAD);
        if len > max_read {
            return Err(TransportError::Read {
                db,
                offset,
                reason: format!("{} bytes exceeds negotiated PDU capacity {}", len, max_read),
            });
        }

        let pdu_ref = self.next_ref();
        let frame = read_request(pdu_ref, db, offset, len);

        let payload = self
            .request(&frame)
            .await
            .map_err(|e| read_error(db, offset, e))?;

        parse_read_response(&payload, pdu_ref).map_err(|e| read_error(db, offset, e))
    }

    async fn disconnect(mut self) {
        // No protocol-level goodbye in S7; closing the stream is it.
        let _ = self.stream.shutdown().await;
        debug!("Disconnected");
    }
}

fn read_error(db: u16, offset: u32, e: TransportError) -> TransportError {
    match e {
        already @ TransportError::Read { .. } => already,
        other => TransportError::Read {
            db,
            offset,
            reason: other.to_string(),
        },
    }
}

/// Wrap a frame body in a TPKT header.
fn tpkt(body: &[u8]) -> Vec<u8> {
    let total = (body.len() + 4) as u16;
    let mut frame = Vec::with_capacity(body.len() + 4);
    frame.extend_from_slice(&[TPKT_VERSION, 0x00]);
    frame.extend_from_slice(&total.to_be_bytes());
    frame.extend_from_slice(body);
    frame
}

/// S7 job header: protocol id, ROSCTR, redundancy, PDU reference,
/// parameter length, data length.
fn s7_job_header(pdu_ref: u16, param_len: u16) -> [u8; 10] {
    let r = pdu_ref.to_be_bytes();
    let p = param_len.to_be_bytes();
    [
        S7_PROTOCOL_ID,
        ROSCTR_JOB,
        0x00,
        0x00,
        r[0],
        r[1],
        p[0],
        p[1],
        0x00,
        0x00,
    ]
}

/// COTP connection request. The destination TSAP second byte encodes the
/// rack and slot (`rack * 0x20 + slot`).
pub(crate) fn cotp_connect_request(rack: u16, slot: u16) -> Vec<u8> {
    let tsap = ((rack << 5) | slot) as u8;
    let body = [
        0x11, // length indicator
        0xE0, // connection request
        0x00, 0x00, // destination reference
        0x00, 0x01, // source reference
        0x00, // class 0
        0xC0, 0x01, 0x0A, // TPDU size 1024
        0xC1, 0x02, 0x01, 0x00, // source TSAP
        0xC2, 0x02, 0x01, tsap, // destination TSAP
    ];
    tpkt(&body)
}

/// Setup Communication request.
pub(crate) fn setup_request(pdu_ref: u16) -> Vec<u8> {
    let pdu = REQUESTED_PDU_SIZE.to_be_bytes();
    let mut body = vec![0x02, 0xF0, 0x80]; // COTP data header
    body.extend_from_slice(&s7_job_header(pdu_ref, 8));
    body.extend_from_slice(&[
        FUNC_SETUP,
        0x00, // reserved
        0x00,
        0x01, // max AMQ calling
        0x00,
        0x01, // max AMQ called
        pdu[0],
        pdu[1],
    ]);
    tpkt(&body)
}

/// Read Var request for `len` bytes of DB `db` starting at byte `offset`.
/// The S7 address field counts bits.
pub(crate) fn read_request(pdu_ref: u16, db: u16, offset: u32, len: usize) -> Vec<u8> {
    let count = (len as u16).to_be_bytes();
    let db_bytes = db.to_be_bytes();
    let bit_addr = offset * 8;

    let mut body = vec![0x02, 0xF0, 0x80];
    body.extend_from_slice(&s7_job_header(pdu_ref, 14));
    body.extend_from_slice(&[
        FUNC_READ_VAR,
        0x01, // item count
        0x12, // variable specification
        0x0A, // address spec length
        0x10, // syntax id: S7ANY
        TRANSPORT_SIZE_BYTE,
        count[0],
        count[1],
        db_bytes[0],
        db_bytes[1],
        AREA_DB,
        (bit_addr >> 16) as u8,
        (bit_addr >> 8) as u8,
        bit_addr as u8,
    ]);
    tpkt(&body)
}

/// Accept a COTP connection confirm.
pub(crate) fn parse_connect_confirm(payload: &[u8]) -> Result<(), TransportError> {
    if payload.len() < 2 || payload[1] != COTP_CONNECT_CONFIRM {
        return Err(TransportError::Protocol(
            "expected COTP connection confirm".to_string(),
        ));
    }
    Ok(())
}

/// Extract the negotiated PDU size out of a Setup Communication ack.
pub(crate) fn parse_setup_response(payload: &[u8]) -> Result<u16, TransportError> {
    check_ack_header(payload)?;

    if payload.len() < 23 || payload[15] != FUNC_SETUP {
        return Err(TransportError::Protocol(
            "malformed setup communication response".to_string(),
        ));
    }

    let negotiated = u16::from_be_bytes([payload[21], payload[22]]);
    if negotiated == 0 {
        return Err(TransportError::Protocol(
            "controller negotiated PDU size 0".to_string(),
        ));
    }
    Ok(negotiated)
}

/// Extract the data bytes out of a Read Var ack.
pub(crate) fn parse_read_response(
    payload: &[u8],
    expected_ref: u16,
) -> Result<Vec<u8>, TransportError> {
    check_ack_header(payload)?;

    let pdu_ref = u16::from_be_bytes([payload[7], payload[8]]);
    if pdu_ref != expected_ref {
        return Err(TransportError::Protocol(format!(
            "PDU reference mismatch: expected {}, got {}",
            expected_ref, pdu_ref
        )));
    }

    if payload.len() < 21 || payload[15] != FUNC_READ_VAR {
        return Err(TransportError::Protocol(
            "malformed read response".to_string(),
        ));
    }

    let return_code = payload[17];
    if return_code != RETURN_OK {
        return Err(TransportError::Protocol(format!(
            "read rejected: {} (0x{:02X})",
            describe_return_code(return_code),
            return_code
        )));
    }

    // Transport sizes 3..5 report the length in bits, octet strings in
    // bytes.
    let transport_size = payload[18];
    let raw_len = u16::from_be_bytes([payload[19], payload[20]]) as usize;
    let data_len = match transport_size {
        0x03..=0x05 => raw_len.div_ceil(8),
        _ => raw_len,
    };

    if payload.len() < 21 + data_len {
        return Err(TransportError::Protocol(format!(
            "read response truncated: announced {} bytes, frame has {}",
            data_len,
            payload.len() - 21
        )));
    }

    Ok(payload[21..21 + data_len].to_vec())
}

/// Validate the fixed part of an ack-data PDU: protocol id, ROSCTR and
/// the header error class/code.
fn check_ack_header(payload: &[u8]) -> Result<(), TransportError> {
    if payload.len() < 15 {
        return Err(TransportError::Protocol(format!(
            "response too short: {} bytes",
            payload.len()
        )));
    }
    if payload[3] != S7_PROTOCOL_ID {
        return Err(TransportError::Protocol(format!(
            "unexpected protocol id 0x{:02X}",
            payload[3]
        )));
    }
    if payload[4] != ROSCTR_ACK_DATA {
        return Err(TransportError::Protocol(format!(
            "unexpected ROSCTR 0x{:02X}",
            payload[4]
        )));
    }

    let (class, code) = (payload[13], payload[14]);
    if class != 0 || code != 0 {
        return Err(TransportError::Protocol(format!(
            "controller returned error class 0x{:02X} code 0x{:02X}",
            class, code
        )));
    }
    Ok(())
}

fn describe_return_code(code: u8) -> &'static str {
    match code {
        0x01 => "hardware fault",
        0x03 => "accessing the object not allowed",
        0x05 => "invalid address",
        0x06 => "data type not supported",
        0x07 => "data type inconsistent",
        0x0A => "object does not exist",
        _ => "unknown error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cotp_connect_request_frame() {
        let frame = cotp_connect_request(0, 2);
        assert_eq!(
            frame,
            vec![
                0x03, 0x00, 0x00, 0x16, // TPKT, 22 bytes
                0x11, 0xE0, 0x00, 0x00, 0x00, 0x01, 0x00, // CR header
                0xC0, 0x01, 0x0A, // TPDU size
                0xC1, 0x02, 0x01, 0x00, // source TSAP
                0xC2, 0x02, 0x01, 0x02, // destination TSAP, rack 0 slot 2
            ]
        );
    }

    #[test]
    fn test_tsap_encodes_rack_and_slot() {
        let frame = cotp_connect_request(1, 3);
        assert_eq!(*frame.last().unwrap(), 0x23);
    }

    #[test]
    fn test_setup_request_frame() {
        let frame = setup_request(1);
        assert_eq!(
            frame,
            vec![
                0x03, 0x00, 0x00, 0x19, // TPKT, 25 bytes
                0x02, 0xF0, 0x80, // COTP data
                0x32, 0x01, 0x00, 0x00, 0x00, 0x01, 0x00, 0x08, 0x00, 0x00, // header
                0xF0, 0x00, 0x00, 0x01, 0x00, 0x01, 0x01, 0xE0, // setup, PDU 480
            ]
        );
    }

    #[test]
    fn test_read_request_frame() {
        let frame = read_request(2, 100, 10, 4);
        assert_eq!(
            frame,
            vec![
                0x03, 0x00, 0x00, 0x1F, // TPKT, 31 bytes
                0x02, 0xF0, 0x80, // COTP data
                0x32, 0x01, 0x00, 0x00, 0x00, 0x02, 0x00, 0x0E, 0x00, 0x00, // header
                0x04, 0x01, // read var, one item
                0x12, 0x0A, 0x10, 0x02, // S7ANY, byte access
                0x00, 0x04, // count
                0x00, 0x64, // DB 100
                0x84, // area DB
                0x00, 0x00, 0x50, // offset 10 as bit address 80
            ]
        );
    }

    #[test]
    fn test_parse_connect_confirm() {
        assert!(parse_connect_confirm(&[0x11, 0xD0, 0x00]).is_ok());
        assert!(parse_connect_confirm(&[0x11, 0xE0, 0x00]).is_err());
        assert!(parse_connect_confirm(&[]).is_err());
    }

    #[test]
    fn test_parse_setup_response() {
        let payload = [
            0x02, 0xF0, 0x80, // COTP
            0x32, 0x03, 0x00, 0x00, 0x00, 0x01, 0x00, 0x08, 0x00, 0x00, 0x00,
            0x00, // ack header
            0xF0, 0x00, 0x00, 0x01, 0x00, 0x01, 0x00, 0xF0, // negotiated 240
        ];
        assert_eq!(parse_setup_response(&payload).unwrap(), 240);
    }

    #[test]
    fn test_parse_read_response_success() {
        let payload = [
            0x02, 0xF0, 0x80, // COTP
            0x32, 0x03, 0x00, 0x00, 0x00, 0x02, 0x00, 0x02, 0x00, 0x08, 0x00,
            0x00, // ack header, ref 2
            0x04, 0x01, // read var, one item
            0xFF, 0x04, 0x00, 0x20, // success, 32 bits
            0xDE, 0xAD, 0xBE, 0xEF,
        ];
        assert_eq!(
            parse_read_response(&payload, 2).unwrap(),
            vec![0xDE, 0xAD, 0xBE, 0xEF]
        );
    }

    #[test]
    fn test_parse_read_response_invalid_address() {
        let payload = [
            0x02, 0xF0, 0x80, //
            0x32, 0x03, 0x00, 0x00, 0x00, 0x02, 0x00, 0x02, 0x00, 0x04, 0x00, 0x00, //
            0x04, 0x01, //
            0x05, 0x00, 0x00, 0x00, // item rejected: invalid address
        ];
        let err = parse_read_response(&payload, 2).unwrap_err();
        assert!(err.to_string().contains("invalid address"));
    }

    #[test]
    fn test_parse_read_response_ref_mismatch() {
        let payload = [
            0x02, 0xF0, 0x80, //
            0x32, 0x03, 0x00, 0x00, 0x00, 0x07, 0x00, 0x02, 0x00, 0x08, 0x00, 0x00, //
            0x04, 0x01, //
            0xFF, 0x04, 0x00, 0x08, 0x2A,
        ];
        let err = parse_read_response(&payload, 2).unwrap_err();
        assert!(err.to_string().contains("PDU reference mismatch"));
    }

    #[test]
    fn test_parse_read_response_header_error() {
        let payload = [
            0x02, 0xF0, 0x80, //
            0x32, 0x03, 0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00, 0x00, 0x81,
            0x04, // error class/code set
        ];
        let err = parse_read_response(&payload, 2).unwrap_err();
        assert!(err.to_string().contains("error class"));
    }

    #[test]
    fn test_parse_read_response_truncated() {
        let payload = [
            0x02, 0xF0, 0x80, //
            0x32, 0x03, 0x00, 0x00, 0x00, 0x02, 0x00, 0x02, 0x00, 0x08, 0x00, 0x00, //
            0x04, 0x01, //
            0xFF, 0x04, 0x00, 0x40, // announces 8 bytes
            0x01, 0x02, // only 2 present
        ];
        let err = parse_read_response(&payload, 2).unwrap_err();
        assert!(err.to_string().contains("truncated"));
    }

    #[test]
    fn test_parse_response_too_short() {
        assert!(parse_read_response(&[0x02, 0xF0], 1).is_err());
    }
}
