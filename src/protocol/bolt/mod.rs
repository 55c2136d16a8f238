//! Bolt v1 wire protocol.
//!
//! Request command layout:
//!
//! ```text
//! 0     1     2           4           6           8          10           12          14         16
//! +-----+-----+-----+-----+-----+-----+-----+-----+-----+-----+-----+-----+-----+-----+-----+-----+
//! |proto| type| cmdcode   |ver2 |   requestID           |codec|        timeout        |  classLen |
//! +-----------+-----------+-----------+-----------+-----------+-----------+-----------+-----------+
//! |headerLen  | contentLen            |                             ... ...                       |
//! +-----------+-----------+-----------+                                                           +
//! |               className + header  + content  bytes                                            |
//! +                                                                                               +
//! |                               ... ...                                                         |
//! +-----------------------------------------------------------------------------------------------+
//! ```
//!
//! Response command layout:
//!
//! ```text
//! 0     1     2     3     4           6           8          10           12          14         16
//! +-----+-----+-----+-----+-----+-----+-----+-----+-----+-----+-----+-----+-----+-----+-----+-----+
//! |proto| type| cmdcode   |ver2 |   requestID           |codec|respstatus |  classLen |headerLen  |
//! +-----------+-----------+-----------+-----------+-----------+-----------+-----------+-----------+
//! | contentLen            |                  ... ...                                              |
//! +-----------------------+                                                                       +
//! |                         className + header  + content  bytes                                  |
//! +                                                                                               +
//! |                               ... ...                                                         |
//! +-----------------------------------------------------------------------------------------------+
//! ```
//!
//! All multi-byte fields are big-endian.

mod codec;
mod command;

pub use command::{BoltRequest, BoltResponse};

use std::sync::Arc;

use bytes::BytesMut;

use crate::cluster::Host;
use crate::pool::{register_pool_factory, ConnectionPool, MultiplexPool};
use crate::protocol::{register_protocol, status, BoxFrame, Frame, Protocol, ProtocolName};
use crate::{AppError, AppResult};

pub const PROTOCOL_NAME: ProtocolName = "bolt";

pub const PROTOCOL_CODE: u8 = 0x01;
pub const PROTOCOL_VERSION: u8 = 0x01;

pub const CMD_TYPE_RESPONSE: u8 = 0;
pub const CMD_TYPE_REQUEST: u8 = 1;
pub const CMD_TYPE_REQUEST_ONEWAY: u8 = 2;

pub const CMD_CODE_HEARTBEAT: u16 = 0;
pub const CMD_CODE_RPC_REQUEST: u16 = 1;
pub const CMD_CODE_RPC_RESPONSE: u16 = 2;

pub const HESSIAN2_SERIALIZE: u8 = 1;

pub const REQUEST_HEADER_LEN: usize = 22;
pub const RESPONSE_HEADER_LEN: usize = 20;
/// minimum bytes needed before the command type can be read
pub const LESS_LEN: usize = RESPONSE_HEADER_LEN;

pub const RESPONSE_STATUS_SUCCESS: u16 = 0;
pub const RESPONSE_STATUS_ERROR: u16 = 1;
pub const RESPONSE_STATUS_SERVER_EXCEPTION: u16 = 2;
pub const RESPONSE_STATUS_UNKNOWN: u16 = 3;
pub const RESPONSE_STATUS_SERVER_THREADPOOL_BUSY: u16 = 4;
pub const RESPONSE_STATUS_ERROR_COMM: u16 = 5;
pub const RESPONSE_STATUS_NO_PROCESSOR: u16 = 6;
pub const RESPONSE_STATUS_TIMEOUT: u16 = 7;
pub const RESPONSE_STATUS_CLIENT_SEND_ERROR: u16 = 8;
pub const RESPONSE_STATUS_CODEC_EXCEPTION: u16 = 9;
pub const RESPONSE_STATUS_CONNECTION_CLOSED: u16 = 10;
pub const RESPONSE_STATUS_SERVER_SERIAL_EXCEPTION: u16 = 11;
pub const RESPONSE_STATUS_SERVER_DESERIAL_EXCEPTION: u16 = 12;

/// header keys bolt uses to expose routing/tracing metadata
pub const HEADER_KEY_SERVICE: &[u8] = b"sofa_head_target_service";
pub const HEADER_KEY_METHOD: &[u8] = b"sofa_head_method_name";

/// Register the bolt codec and its multiplexed pool profile. Safe to call
/// more than once; the registries replace prior entries by name.
pub fn register() {
    register_protocol(Arc::new(BoltProtocol));
    register_pool_factory(PROTOCOL_NAME, multiplex_pool_factory);
}

fn multiplex_pool_factory(host: Arc<Host>) -> Arc<dyn ConnectionPool> {
    MultiplexPool::new(host, Arc::new(BoltProtocol))
}

#[derive(Debug, Default)]
pub struct BoltProtocol;

impl Protocol for BoltProtocol {
    fn name(&self) -> ProtocolName {
        PROTOCOL_NAME
    }

    fn decode(&self, buf: &mut BytesMut) -> AppResult<Option<BoxFrame>> {
        if buf.len() < LESS_LEN {
            return Ok(None);
        }
        let cmd_type = buf[1];
        match cmd_type {
            CMD_TYPE_REQUEST | CMD_TYPE_REQUEST_ONEWAY => codec::decode_request(buf),
            CMD_TYPE_RESPONSE => codec::decode_response(buf),
            _ => Err(AppError::MalformedProtocol(format!(
                "unknown bolt cmd type: {}",
                cmd_type
            ))),
        }
    }

    fn encode(&self, frame: &dyn Frame) -> AppResult<BytesMut> {
        if let Some(request) = frame.as_any().downcast_ref::<BoltRequest>() {
            return Ok(codec::encode_request(request));
        }
        if let Some(response) = frame.as_any().downcast_ref::<BoltResponse>() {
            return Ok(codec::encode_response(response));
        }
        Err(AppError::UnknownFrameType(PROTOCOL_NAME))
    }

    fn heartbeat_trigger(&self, request_id: u64) -> BoxFrame {
        Box::new(BoltRequest::new_heartbeat(request_id as u32))
    }

    fn heartbeat_reply(&self, request_id: u64) -> BoxFrame {
        Box::new(BoltResponse::new_heartbeat_ack(request_id as u32))
    }

    fn hijack_reply(&self, status: u32) -> BoxFrame {
        Box::new(BoltResponse::new_hijack(status as u16))
    }

    fn map_status(&self, proxy_status: u32) -> u32 {
        let mapped = match proxy_status {
            status::SUCCESS => RESPONSE_STATUS_SUCCESS,
            status::ROUTER_UNAVAILABLE => RESPONSE_STATUS_NO_PROCESSOR,
            status::NO_HEALTH_UPSTREAM => RESPONSE_STATUS_CONNECTION_CLOSED,
            status::UPSTREAM_OVERFLOW => RESPONSE_STATUS_SERVER_THREADPOOL_BUSY,
            status::CODEC_EXCEPTION => RESPONSE_STATUS_CODEC_EXCEPTION,
            status::DESERIAL_EXCEPTION => RESPONSE_STATUS_SERVER_DESERIAL_EXCEPTION,
            status::TIMEOUT => RESPONSE_STATUS_TIMEOUT,
            _ => RESPONSE_STATUS_UNKNOWN,
        };
        mapped as u32
    }

    fn service_name(&self, frame: &dyn Frame) -> Option<String> {
        frame
            .header()
            .get(HEADER_KEY_SERVICE)
            .map(|v| String::from_utf8_lossy(v).into_owned())
    }

    fn method_name(&self, frame: &dyn Frame) -> Option<String> {
        frame
            .header()
            .get(HEADER_KEY_METHOD)
            .map(|v| String::from_utf8_lossy(v).into_owned())
    }
}
