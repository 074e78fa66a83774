//! Logical RPC messages and their binary layout.
//!
//! Every message starts with a kind byte and the 16-byte `request_id` used to
//! correlate replies with requests. The remaining fields depend on the kind:
//!
//! ```text
//! [u8 kind][16B request_id][fields...]
//!
//! bool          1 byte
//! GUID          16 bytes
//! int           i32 BE
//! bytes?        u8 present + (u32 BE len + data)
//! list<bytes>   u32 BE count + count * (u32 BE len + data)
//! list<bytes>?  u8 present + list<bytes>
//! string        u32 BE len + UTF-8
//! string?       u8 present + string
//! ErrorCode     u16 BE
//! ```

use crate::error::{ErrorCode, RemoteException, Result, RpcError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use uuid::Uuid;

pub type MethodId = i32;
pub type PropertyId = i32;
pub type EventId = i32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketKind {
    GetInstance = 1,
    ServiceInstance = 2,
    ReleaseInstance = 3,
    MethodCall = 4,
    MethodResult = 5,
    GetProperty = 6,
    SetProperty = 7,
    PropertyValue = 8,
    SubscribeForEvent = 9,
    UnsubscribeFromEvent = 10,
    EventData = 11,
    Success = 12,
    Exception = 13,
    Error = 14,
    CancelRequest = 15,
}

impl PacketKind {
    fn from_u8(value: u8) -> Option<Self> {
        let kind = match value {
            1 => PacketKind::GetInstance,
            2 => PacketKind::ServiceInstance,
            3 => PacketKind::ReleaseInstance,
            4 => PacketKind::MethodCall,
            5 => PacketKind::MethodResult,
            6 => PacketKind::GetProperty,
            7 => PacketKind::SetProperty,
            8 => PacketKind::PropertyValue,
            9 => PacketKind::SubscribeForEvent,
            10 => PacketKind::UnsubscribeFromEvent,
            11 => PacketKind::EventData,
            12 => PacketKind::Success,
            13 => PacketKind::Exception,
            14 => PacketKind::Error,
            15 => PacketKind::CancelRequest,
            _ => return None,
        };
        Some(kind)
    }

    pub fn name(self) -> &'static str {
        match self {
            PacketKind::GetInstance => "GetInstance",
            PacketKind::ServiceInstance => "ServiceInstance",
            PacketKind::ReleaseInstance => "ReleaseInstance",
            PacketKind::MethodCall => "MethodCall",
            PacketKind::MethodResult => "MethodResult",
            PacketKind::GetProperty => "GetProperty",
            PacketKind::SetProperty => "SetProperty",
            PacketKind::PropertyValue => "PropertyValue",
            PacketKind::SubscribeForEvent => "SubscribeForEvent",
            PacketKind::UnsubscribeFromEvent => "UnsubscribeFromEvent",
            PacketKind::EventData => "EventData",
            PacketKind::Success => "Success",
            PacketKind::Exception => "Exception",
            PacketKind::Error => "Error",
            PacketKind::CancelRequest => "CancelRequest",
        }
    }
}

/// A logical RPC message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcPacket {
    GetInstance {
        request_id: Uuid,
        interface_id: Uuid,
        instance_id: Option<Uuid>,
    },
    ServiceInstance {
        request_id: Uuid,
        instance_id: Uuid,
    },
    ReleaseInstance {
        request_id: Uuid,
        instance_id: Uuid,
    },
    MethodCall {
        request_id: Uuid,
        one_way: bool,
        instance_id: Uuid,
        method_id: MethodId,
        args: Vec<Bytes>,
    },
    MethodResult {
        request_id: Uuid,
        result: Option<Bytes>,
        args: Option<Vec<Bytes>>,
    },
    GetProperty {
        request_id: Uuid,
        instance_id: Uuid,
        property_id: PropertyId,
    },
    SetProperty {
        request_id: Uuid,
        instance_id: Uuid,
        property_id: PropertyId,
        value: Option<Bytes>,
    },
    PropertyValue {
        request_id: Uuid,
        value: Option<Bytes>,
    },
    SubscribeForEvent {
        request_id: Uuid,
        instance_id: Uuid,
        event_id: EventId,
    },
    UnsubscribeFromEvent {
        request_id: Uuid,
        instance_id: Uuid,
        event_id: EventId,
    },
    EventData {
        request_id: Uuid,
        instance_id: Uuid,
        event_id: EventId,
        args: Vec<Bytes>,
    },
    Success {
        request_id: Uuid,
    },
    Exception {
        request_id: Uuid,
        type_name: String,
        message: String,
        stack: Option<String>,
    },
    Error {
        request_id: Uuid,
        code: ErrorCode,
        stack: Option<String>,
    },
    CancelRequest {
        request_id: Uuid,
    },
}

impl RpcPacket {
    pub fn get_instance(interface_id: Uuid) -> Self {
        RpcPacket::GetInstance {
            request_id: Uuid::new_v4(),
            interface_id,
            instance_id: None,
        }
    }

    pub fn release_instance(instance_id: Uuid) -> Self {
        RpcPacket::ReleaseInstance {
            request_id: Uuid::new_v4(),
            instance_id,
        }
    }

    pub fn method_call(
        instance_id: Uuid,
        method_id: MethodId,
        args: Vec<Bytes>,
        one_way: bool,
    ) -> Self {
        RpcPacket::MethodCall {
            request_id: Uuid::new_v4(),
            one_way,
            instance_id,
            method_id,
            args,
        }
    }

    pub fn get_property(instance_id: Uuid, property_id: PropertyId) -> Self {
        RpcPacket::GetProperty {
            request_id: Uuid::new_v4(),
            instance_id,
            property_id,
        }
    }

    pub fn set_property(instance_id: Uuid, property_id: PropertyId, value: Option<Bytes>) -> Self {
        RpcPacket::SetProperty {
            request_id: Uuid::new_v4(),
            instance_id,
            property_id,
            value,
        }
    }

    pub fn subscribe(instance_id: Uuid, event_id: EventId) -> Self {
        RpcPacket::SubscribeForEvent {
            request_id: Uuid::new_v4(),
            instance_id,
            event_id,
        }
    }

    pub fn unsubscribe(instance_id: Uuid, event_id: EventId) -> Self {
        RpcPacket::UnsubscribeFromEvent {
            request_id: Uuid::new_v4(),
            instance_id,
            event_id,
        }
    }

    pub fn event_data(instance_id: Uuid, event_id: EventId, args: Vec<Bytes>) -> Self {
        RpcPacket::EventData {
            request_id: Uuid::new_v4(),
            instance_id,
            event_id,
            args,
        }
    }

    pub fn service_instance(request_id: Uuid, instance_id: Uuid) -> Self {
        RpcPacket::ServiceInstance {
            request_id,
            instance_id,
        }
    }

    pub fn method_result(request_id: Uuid, result: Option<Bytes>, args: Option<Vec<Bytes>>) -> Self {
        RpcPacket::MethodResult {
            request_id,
            result,
            args,
        }
    }

    pub fn property_value(request_id: Uuid, value: Option<Bytes>) -> Self {
        RpcPacket::PropertyValue { request_id, value }
    }

    pub fn success(request_id: Uuid) -> Self {
        RpcPacket::Success { request_id }
    }

    pub fn cancel(request_id: Uuid) -> Self {
        RpcPacket::CancelRequest { request_id }
    }

    /// Reply describing `err`: an `Error` packet for protocol-level errors,
    /// an `Exception` packet for everything else.
    pub fn failure(request_id: Uuid, err: &RpcError) -> Self {
        match err {
            RpcError::Remote { code, stack } => RpcPacket::Error {
                request_id,
                code: *code,
                stack: stack.clone(),
            },
            other => match other.error_code() {
                Some(code) => RpcPacket::Error {
                    request_id,
                    code,
                    stack: None,
                },
                None => {
                    let exception = other.to_exception();
                    RpcPacket::Exception {
                        request_id,
                        type_name: exception.type_name,
                        message: exception.message,
                        stack: exception.stack,
                    }
                }
            },
        }
    }

    pub fn request_id(&self) -> Uuid {
        match self {
            RpcPacket::GetInstance { request_id, .. }
            | RpcPacket::ServiceInstance { request_id, .. }
            | RpcPacket::ReleaseInstance { request_id, .. }
            | RpcPacket::MethodCall { request_id, .. }
            | RpcPacket::MethodResult { request_id, .. }
            | RpcPacket::GetProperty { request_id, .. }
            | RpcPacket::SetProperty { request_id, .. }
            | RpcPacket::PropertyValue { request_id, .. }
            | RpcPacket::SubscribeForEvent { request_id, .. }
            | RpcPacket::UnsubscribeFromEvent { request_id, .. }
            | RpcPacket::EventData { request_id, .. }
            | RpcPacket::Success { request_id }
            | RpcPacket::Exception { request_id, .. }
            | RpcPacket::Error { request_id, .. }
            | RpcPacket::CancelRequest { request_id } => *request_id,
        }
    }

    pub fn kind(&self) -> PacketKind {
        match self {
            RpcPacket::GetInstance { .. } => PacketKind::GetInstance,
            RpcPacket::ServiceInstance { .. } => PacketKind::ServiceInstance,
            RpcPacket::ReleaseInstance { .. } => PacketKind::ReleaseInstance,
            RpcPacket::MethodCall { .. } => PacketKind::MethodCall,
            RpcPacket::MethodResult { .. } => PacketKind::MethodResult,
            RpcPacket::GetProperty { .. } => PacketKind::GetProperty,
            RpcPacket::SetProperty { .. } => PacketKind::SetProperty,
            RpcPacket::PropertyValue { .. } => PacketKind::PropertyValue,
            RpcPacket::SubscribeForEvent { .. } => PacketKind::SubscribeForEvent,
            RpcPacket::UnsubscribeFromEvent { .. } => PacketKind::UnsubscribeFromEvent,
            RpcPacket::EventData { .. } => PacketKind::EventData,
            RpcPacket::Success { .. } => PacketKind::Success,
            RpcPacket::Exception { .. } => PacketKind::Exception,
            RpcPacket::Error { .. } => PacketKind::Error,
            RpcPacket::CancelRequest { .. } => PacketKind::CancelRequest,
        }
    }

    /// Whether this inbound request expects no reply.
    pub fn is_one_way(&self) -> bool {
        matches!(
            self,
            RpcPacket::MethodCall { one_way: true, .. } | RpcPacket::EventData { .. }
        )
    }

    /// Whether this packet answers a request rather than making one.
    pub fn is_reply(&self) -> bool {
        matches!(
            self,
            RpcPacket::ServiceInstance { .. }
                | RpcPacket::MethodResult { .. }
                | RpcPacket::PropertyValue { .. }
                | RpcPacket::Success { .. }
                | RpcPacket::Exception { .. }
                | RpcPacket::Error { .. }
        )
    }

    /// Turn a reply into the caller's result: `Exception` and `Error` replies
    /// become errors, anything else is handed back unchanged.
    pub fn into_result(self) -> Result<RpcPacket> {
        match self {
            RpcPacket::Exception {
                type_name,
                message,
                stack,
                ..
            } => Err(RpcError::ServerException(RemoteException {
                type_name,
                message,
                stack,
            })),
            RpcPacket::Error { code, stack, .. } => Err(RpcError::Remote { code, stack }),
            other => Ok(other),
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_u8(self.kind() as u8);
        put_uuid(&mut buf, self.request_id());

        match self {
            RpcPacket::GetInstance {
                interface_id,
                instance_id,
                ..
            } => {
                put_uuid(&mut buf, *interface_id);
                match instance_id {
                    Some(id) => {
                        buf.put_u8(1);
                        put_uuid(&mut buf, *id);
                    }
                    None => buf.put_u8(0),
                }
            }
            RpcPacket::ServiceInstance { instance_id, .. }
            | RpcPacket::ReleaseInstance { instance_id, .. } => put_uuid(&mut buf, *instance_id),
            RpcPacket::MethodCall {
                one_way,
                instance_id,
                method_id,
                args,
                ..
            } => {
                buf.put_u8(u8::from(*one_way));
                put_uuid(&mut buf, *instance_id);
                buf.put_i32(*method_id);
                put_list(&mut buf, args);
            }
            RpcPacket::MethodResult { result, args, .. } => {
                put_opt_bytes(&mut buf, result.as_ref());
                match args {
                    Some(args) => {
                        buf.put_u8(1);
                        put_list(&mut buf, args);
                    }
                    None => buf.put_u8(0),
                }
            }
            RpcPacket::GetProperty {
                instance_id,
                property_id,
                ..
            } => {
                put_uuid(&mut buf, *instance_id);
                buf.put_i32(*property_id);
            }
            RpcPacket::SetProperty {
                instance_id,
                property_id,
                value,
                ..
            } => {
                put_uuid(&mut buf, *instance_id);
                buf.put_i32(*property_id);
                put_opt_bytes(&mut buf, value.as_ref());
            }
            RpcPacket::PropertyValue { value, .. } => put_opt_bytes(&mut buf, value.as_ref()),
            RpcPacket::SubscribeForEvent {
                instance_id,
                event_id,
                ..
            }
            | RpcPacket::UnsubscribeFromEvent {
                instance_id,
                event_id,
                ..
            } => {
                put_uuid(&mut buf, *instance_id);
                buf.put_i32(*event_id);
            }
            RpcPacket::EventData {
                instance_id,
                event_id,
                args,
                ..
            } => {
                put_uuid(&mut buf, *instance_id);
                buf.put_i32(*event_id);
                put_list(&mut buf, args);
            }
            RpcPacket::Success { .. } | RpcPacket::CancelRequest { .. } => {}
            RpcPacket::Exception {
                type_name,
                message,
                stack,
                ..
            } => {
                put_string(&mut buf, type_name);
                put_string(&mut buf, message);
                put_opt_string(&mut buf, stack.as_deref());
            }
            RpcPacket::Error { code, stack, .. } => {
                buf.put_u16(code.as_u16());
                put_opt_string(&mut buf, stack.as_deref());
            }
        }

        buf.freeze()
    }

    pub fn decode(data: &[u8]) -> Result<RpcPacket> {
        let mut r = Reader { buf: data };
        let raw_kind = r.u8()?;
        let kind = PacketKind::from_u8(raw_kind)
            .ok_or_else(|| RpcError::Malformed(format!("unknown packet kind {raw_kind}")))?;
        let request_id = r.uuid()?;

        let packet = match kind {
            PacketKind::GetInstance => {
                let interface_id = r.uuid()?;
                let instance_id = if r.flag()? { Some(r.uuid()?) } else { None };
                RpcPacket::GetInstance {
                    request_id,
                    interface_id,
                    instance_id,
                }
            }
            PacketKind::ServiceInstance => RpcPacket::ServiceInstance {
                request_id,
                instance_id: r.uuid()?,
            },
            PacketKind::ReleaseInstance => RpcPacket::ReleaseInstance {
                request_id,
                instance_id: r.uuid()?,
            },
            PacketKind::MethodCall => RpcPacket::MethodCall {
                request_id,
                one_way: r.flag()?,
                instance_id: r.uuid()?,
                method_id: r.i32()?,
                args: r.list()?,
            },
            PacketKind::MethodResult => {
                let result = r.opt_bytes()?;
                let args = if r.flag()? { Some(r.list()?) } else { None };
                RpcPacket::MethodResult {
                    request_id,
                    result,
                    args,
                }
            }
            PacketKind::GetProperty => RpcPacket::GetProperty {
                request_id,
                instance_id: r.uuid()?,
                property_id: r.i32()?,
            },
            PacketKind::SetProperty => RpcPacket::SetProperty {
                request_id,
                instance_id: r.uuid()?,
                property_id: r.i32()?,
                value: r.opt_bytes()?,
            },
            PacketKind::PropertyValue => RpcPacket::PropertyValue {
                request_id,
                value: r.opt_bytes()?,
            },
            PacketKind::SubscribeForEvent => RpcPacket::SubscribeForEvent {
                request_id,
                instance_id: r.uuid()?,
                event_id: r.i32()?,
            },
            PacketKind::UnsubscribeFromEvent => RpcPacket::UnsubscribeFromEvent {
                request_id,
                instance_id: r.uuid()?,
                event_id: r.i32()?,
            },
            PacketKind::EventData => RpcPacket::EventData {
                request_id,
                instance_id: r.uuid()?,
                event_id: r.i32()?,
                args: r.list()?,
            },
            PacketKind::Success => RpcPacket::Success { request_id },
            PacketKind::Exception => RpcPacket::Exception {
                request_id,
                type_name: r.string()?,
                message: r.string()?,
                stack: r.opt_string()?,
            },
            PacketKind::Error => RpcPacket::Error {
                request_id,
                code: ErrorCode::from_u16(r.u16()?),
                stack: r.opt_string()?,
            },
            PacketKind::CancelRequest => RpcPacket::CancelRequest { request_id },
        };

        if r.buf.has_remaining() {
            return Err(RpcError::Malformed(format!(
                "{} trailing bytes after {} packet",
                r.buf.remaining(),
                kind.name()
            )));
        }
        Ok(packet)
    }
}

fn put_uuid(buf: &mut BytesMut, id: Uuid) {
    buf.put_slice(id.as_bytes());
}

fn put_bytes(buf: &mut BytesMut, data: &[u8]) {
    buf.put_u32(data.len() as u32);
    buf.put_slice(data);
}

fn put_opt_bytes(buf: &mut BytesMut, data: Option<&Bytes>) {
    match data {
        Some(data) => {
            buf.put_u8(1);
            put_bytes(buf, data);
        }
        None => buf.put_u8(0),
    }
}

fn put_list(buf: &mut BytesMut, items: &[Bytes]) {
    buf.put_u32(items.len() as u32);
    for item in items {
        put_bytes(buf, item);
    }
}

fn put_string(buf: &mut BytesMut, value: &str) {
    put_bytes(buf, value.as_bytes());
}

fn put_opt_string(buf: &mut BytesMut, value: Option<&str>) {
    match value {
        Some(value) => {
            buf.put_u8(1);
            put_string(buf, value);
        }
        None => buf.put_u8(0),
    }
}

/// Bounds-checked cursor over an encoded packet.
struct Reader<'a> {
    buf: &'a [u8],
}

impl Reader<'_> {
    fn need(&self, n: usize) -> Result<()> {
        if self.buf.remaining() < n {
            return Err(RpcError::Malformed(format!(
                "expected {n} more bytes, {} left",
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    fn u8(&mut self) -> Result<u8> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    fn flag(&mut self) -> Result<bool> {
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(RpcError::Malformed(format!("invalid flag byte {other}"))),
        }
    }

    fn u16(&mut self) -> Result<u16> {
        self.need(2)?;
        Ok(self.buf.get_u16())
    }

    fn i32(&mut self) -> Result<i32> {
        self.need(4)?;
        Ok(self.buf.get_i32())
    }

    fn uuid(&mut self) -> Result<Uuid> {
        self.need(16)?;
        let mut raw = [0u8; 16];
        self.buf.copy_to_slice(&mut raw);
        Ok(Uuid::from_bytes(raw))
    }

    fn bytes(&mut self) -> Result<Bytes> {
        self.need(4)?;
        let len = self.buf.get_u32() as usize;
        self.need(len)?;
        Ok(self.buf.copy_to_bytes(len))
    }

    fn opt_bytes(&mut self) -> Result<Option<Bytes>> {
        if self.flag()? {
            Ok(Some(self.bytes()?))
        } else {
            Ok(None)
        }
    }

    fn list(&mut self) -> Result<Vec<Bytes>> {
        self.need(4)?;
        let count = self.buf.get_u32() as usize;
        // Each element needs at least its length prefix.
        self.need(count.saturating_mul(4))?;
        let mut items = Vec::with_capacity(count);
        for _ in 0..count {
            items.push(self.bytes()?);
        }
        Ok(items)
    }

    fn string(&mut self) -> Result<String> {
        let raw = self.bytes()?;
        String::from_utf8(raw.to_vec())
            .map_err(|e| RpcError::Malformed(format!("invalid UTF-8 string: {e}")))
    }

    fn opt_string(&mut self) -> Result<Option<String>> {
        if self.flag()? {
            Ok(Some(self.string()?))
        } else {
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b(data: &'static [u8]) -> Bytes {
        Bytes::from_static(data)
    }

    #[test]
    fn test_every_kind_survives_the_wire() {
        let id = Uuid::new_v4();
        let packets = vec![
            RpcPacket::GetInstance {
                request_id: Uuid::new_v4(),
                interface_id: id,
                instance_id: Some(Uuid::new_v4()),
            },
            RpcPacket::get_instance(id),
            RpcPacket::ServiceInstance {
                request_id: Uuid::new_v4(),
                instance_id: id,
            },
            RpcPacket::release_instance(id),
            RpcPacket::method_call(id, 3, vec![b(b"3"), b(b""), b(b"5")], true),
            RpcPacket::MethodResult {
                request_id: Uuid::new_v4(),
                result: Some(b(b"8")),
                args: Some(vec![b(b"out")]),
            },
            RpcPacket::MethodResult {
                request_id: Uuid::new_v4(),
                result: None,
                args: None,
            },
            RpcPacket::get_property(id, 2),
            RpcPacket::set_property(id, 2, Some(b(b"42"))),
            RpcPacket::set_property(id, 2, None),
            RpcPacket::PropertyValue {
                request_id: Uuid::new_v4(),
                value: Some(b(b"42")),
            },
            RpcPacket::subscribe(id, 7),
            RpcPacket::unsubscribe(id, 7),
            RpcPacket::event_data(id, 7, vec![b(b"payload")]),
            RpcPacket::success(Uuid::new_v4()),
            RpcPacket::Exception {
                request_id: Uuid::new_v4(),
                type_name: "DivideByZero".to_string(),
                message: "division by zero".to_string(),
                stack: Some("at divide".to_string()),
            },
            RpcPacket::Error {
                request_id: Uuid::new_v4(),
                code: ErrorCode::InstanceNotFound,
                stack: None,
            },
            RpcPacket::cancel(Uuid::new_v4()),
        ];

        for packet in packets {
            let decoded = RpcPacket::decode(&packet.encode()).unwrap();
            assert_eq!(decoded, packet);
        }
    }

    #[test]
    fn test_method_call_layout() {
        let request_id = Uuid::from_u128(1);
        let instance_id = Uuid::from_u128(2);
        let packet = RpcPacket::MethodCall {
            request_id,
            one_way: false,
            instance_id,
            method_id: 9,
            args: vec![b(b"ab")],
        };
        let wire = packet.encode();

        assert_eq!(wire[0], PacketKind::MethodCall as u8);
        assert_eq!(&wire[1..17], request_id.as_bytes());
        assert_eq!(wire[17], 0);
        assert_eq!(&wire[18..34], instance_id.as_bytes());
        assert_eq!(&wire[34..38], &9i32.to_be_bytes());
        assert_eq!(&wire[38..42], &1u32.to_be_bytes());
        assert_eq!(&wire[42..46], &2u32.to_be_bytes());
        assert_eq!(&wire[46..], b"ab");
    }

    #[test]
    fn test_decode_rejects_malformed_input() {
        assert!(matches!(RpcPacket::decode(&[]), Err(RpcError::Malformed(_))));
        assert!(matches!(
            RpcPacket::decode(&[0xEE; 17]),
            Err(RpcError::Malformed(_))
        ));

        let wire = RpcPacket::release_instance(Uuid::new_v4()).encode();
        assert!(RpcPacket::decode(&wire[..wire.len() - 1]).is_err());

        let mut trailing = wire.to_vec();
        trailing.push(0);
        assert!(RpcPacket::decode(&trailing).is_err());
    }

    #[test]
    fn test_decode_rejects_oversized_list_count() {
        let mut wire = BytesMut::new();
        wire.put_u8(PacketKind::EventData as u8);
        put_uuid(&mut wire, Uuid::new_v4());
        put_uuid(&mut wire, Uuid::new_v4());
        wire.put_i32(1);
        wire.put_u32(u32::MAX);
        assert!(matches!(
            RpcPacket::decode(&wire),
            Err(RpcError::Malformed(_))
        ));
    }

    #[test]
    fn test_failure_replies() {
        let request_id = Uuid::new_v4();

        let reply = RpcPacket::failure(request_id, &RpcError::InstanceNotFound(Uuid::nil()));
        assert_eq!(
            reply,
            RpcPacket::Error {
                request_id,
                code: ErrorCode::InstanceNotFound,
                stack: None
            }
        );

        let err: RpcError = RemoteException::new("Overflow", "too big").into();
        let reply = RpcPacket::failure(request_id, &err);
        assert_eq!(reply.kind(), PacketKind::Exception);

        match reply.into_result() {
            Err(RpcError::ServerException(exception)) => {
                assert_eq!(exception.type_name, "Overflow");
                assert_eq!(exception.message, "too big");
            }
            other => panic!("expected server exception, got {other:?}"),
        }
    }

    #[test]
    fn test_into_result_maps_error_code() {
        let reply = RpcPacket::Error {
            request_id: Uuid::new_v4(),
            code: ErrorCode::ServiceNotAvailable,
            stack: Some("host".to_string()),
        };
        match reply.into_result() {
            Err(RpcError::Remote { code, stack }) => {
                assert_eq!(code, ErrorCode::ServiceNotAvailable);
                assert_eq!(stack.as_deref(), Some("host"));
            }
            other => panic!("expected remote error, got {other:?}"),
        }

        let ok = RpcPacket::success(Uuid::new_v4());
        assert_eq!(ok.clone().into_result().unwrap(), ok);
    }

    #[test]
    fn test_one_way_detection() {
        let id = Uuid::new_v4();
        assert!(RpcPacket::method_call(id, 1, vec![], true).is_one_way());
        assert!(!RpcPacket::method_call(id, 1, vec![], false).is_one_way());
        assert!(RpcPacket::event_data(id, 1, vec![]).is_one_way());
        assert!(!RpcPacket::get_property(id, 1).is_one_way());
    }
}
