use std::any::Any;

use bytes::Bytes;

use crate::protocol::{Frame, Header, StreamType};

use super::{
    CMD_CODE_HEARTBEAT, CMD_CODE_RPC_REQUEST, CMD_CODE_RPC_RESPONSE, CMD_TYPE_REQUEST,
    CMD_TYPE_REQUEST_ONEWAY, CMD_TYPE_RESPONSE, HESSIAN2_SERIALIZE, PROTOCOL_VERSION,
    RESPONSE_STATUS_SUCCESS,
};

#[derive(Debug, Clone, PartialEq)]
pub struct BoltRequest {
    pub cmd_type: u8,
    pub cmd_code: u16,
    pub version: u8,
    pub request_id: u32,
    pub codec: u8,
    /// -1 means no timeout, used by heartbeats
    pub timeout_ms: i32,
    pub class: Bytes,
    pub header: Header,
    pub content: Bytes,
}

impl BoltRequest {
    pub fn new(
        request_id: u32,
        class: Bytes,
        timeout_ms: i32,
        header: Header,
        content: Bytes,
    ) -> BoltRequest {
        BoltRequest {
            cmd_type: CMD_TYPE_REQUEST,
            cmd_code: CMD_CODE_RPC_REQUEST,
            version: PROTOCOL_VERSION,
            request_id,
            codec: HESSIAN2_SERIALIZE,
            timeout_ms,
            class,
            header,
            content,
        }
    }

    pub fn new_oneway(request_id: u32, class: Bytes, header: Header, content: Bytes) -> BoltRequest {
        BoltRequest {
            cmd_type: CMD_TYPE_REQUEST_ONEWAY,
            ..BoltRequest::new(request_id, class, -1, header, content)
        }
    }

    pub fn new_heartbeat(request_id: u32) -> BoltRequest {
        BoltRequest {
            cmd_type: CMD_TYPE_REQUEST,
            cmd_code: CMD_CODE_HEARTBEAT,
            version: PROTOCOL_VERSION,
            request_id,
            codec: HESSIAN2_SERIALIZE,
            timeout_ms: -1,
            class: Bytes::new(),
            header: Header::new(),
            content: Bytes::new(),
        }
    }
}

impl Frame for BoltRequest {
    fn request_id(&self) -> u64 {
        self.request_id as u64
    }

    fn set_request_id(&mut self, id: u64) {
        self.request_id = id as u32;
    }

    fn stream_type(&self) -> StreamType {
        if self.cmd_type == CMD_TYPE_REQUEST_ONEWAY {
            StreamType::OnewayRequest
        } else {
            StreamType::Request
        }
    }

    fn is_heartbeat(&self) -> bool {
        self.cmd_code == CMD_CODE_HEARTBEAT
    }

    fn header(&self) -> &Header {
        &self.header
    }

    fn header_mut(&mut self) -> &mut Header {
        &mut self.header
    }

    fn payload(&self) -> &[u8] {
        &self.content
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BoltResponse {
    pub cmd_type: u8,
    pub cmd_code: u16,
    pub version: u8,
    pub request_id: u32,
    pub codec: u8,
    pub status: u16,
    pub class: Bytes,
    pub header: Header,
    pub content: Bytes,
}

impl BoltResponse {
    pub fn new(request_id: u32, status: u16, class: Bytes, header: Header, content: Bytes) -> BoltResponse {
        BoltResponse {
            cmd_type: CMD_TYPE_RESPONSE,
            cmd_code: CMD_CODE_RPC_RESPONSE,
            version: PROTOCOL_VERSION,
            request_id,
            codec: HESSIAN2_SERIALIZE,
            status,
            class,
            header,
            content,
        }
    }

    pub fn new_heartbeat_ack(request_id: u32) -> BoltResponse {
        BoltResponse {
            cmd_type: CMD_TYPE_RESPONSE,
            cmd_code: CMD_CODE_HEARTBEAT,
            version: PROTOCOL_VERSION,
            request_id,
            codec: HESSIAN2_SERIALIZE,
            status: RESPONSE_STATUS_SUCCESS,
            class: Bytes::new(),
            header: Header::new(),
            content: Bytes::new(),
        }
    }

    /// Proxy-originated response; the stream layer overwrites the
    /// request id before the frame is written out.
    pub fn new_hijack(status: u16) -> BoltResponse {
        BoltResponse {
            cmd_type: CMD_TYPE_RESPONSE,
            cmd_code: CMD_CODE_RPC_RESPONSE,
            version: PROTOCOL_VERSION,
            request_id: 0,
            codec: HESSIAN2_SERIALIZE,
            status,
            class: Bytes::new(),
            header: Header::new(),
            content: Bytes::new(),
        }
    }
}

impl Frame for BoltResponse {
    fn request_id(&self) -> u64 {
        self.request_id as u64
    }

    fn set_request_id(&mut self, id: u64) {
        self.request_id = id as u32;
    }

    fn stream_type(&self) -> StreamType {
        StreamType::Response
    }

    fn is_heartbeat(&self) -> bool {
        self.cmd_code == CMD_CODE_HEARTBEAT
    }

    fn header(&self) -> &Header {
        &self.header
    }

    fn header_mut(&mut self) -> &mut Header {
        &mut self.header
    }

    fn payload(&self) -> &[u8] {
        &self.content
    }

    fn status(&self) -> u32 {
        self.status as u32
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
