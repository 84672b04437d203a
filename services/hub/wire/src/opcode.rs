//! Opcode table for coordinator API frames.
//!
//! Requests carry even opcodes and the matching reply is `request + 1`.
//! Push frames (log events, connected-path replies) arrive without a request.

/// API frame opcodes (payload[0])
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    /// Echo request
    EchoRequest = 0,
    /// Echo reply
    EchoReply = 1,
    /// Firmware revision request
    FirmRevRequest = 2,
    /// Firmware revision reply
    FirmRevReply = 3,
    /// Node id request
    NodeIdRequest = 4,
    /// Node id reply
    NodeIdReply = 5,
    /// Set node tag request
    SetTagRequest = 8,
    /// Set node tag reply
    SetTagReply = 9,
    /// Clear bound server request
    BindClearRequest = 10,
    /// Clear bound server reply
    BindClearReply = 11,
    /// Set radio channel request
    SetChannelRequest = 12,
    /// Set radio channel reply
    SetChannelReply = 13,
    /// Node configuration request
    NodeConfigRequest = 14,
    /// Node configuration reply
    NodeConfigReply = 15,
    /// Reboot request
    RebootRequest = 24,
    /// Reboot reply
    RebootReply = 25,
    /// Discovery group request (sub-opcode at payload[1])
    DiscoveryRequest = 26,
    /// Discovery group reply (sub-opcode at payload[1])
    DiscoveryReply = 27,
    /// Flash group request (sub-opcode at payload[1])
    FlashRequest = 30,
    /// Flash group reply (sub-opcode at payload[1])
    FlashReply = 31,
    /// Entity counters request
    EntitiesCountRequest = 38,
    /// Entity counters reply
    EntitiesCountReply = 39,
    /// Entity hash request
    EntityHashRequest = 40,
    /// Entity hash reply
    EntityHashReply = 41,
    /// Entity state read request
    GetEntityStateRequest = 42,
    /// Entity state read reply
    GetEntityStateReply = 43,
    /// Entity state write request
    SetEntityStateRequest = 44,
    /// Entity state write reply
    SetEntityStateReply = 45,
    /// Log line pushed by a node
    LogEvent = 57,
    /// Single hop envelope
    Unicast = 114,
    /// Source routed multi hop envelope
    Multipath = 118,
    /// Connected-path (virtual circuit) request
    ConnectedPathRequest = 122,
    /// Connected-path (virtual circuit) reply
    ConnectedPathReply = 123,
}

impl Opcode {
    /// True for request opcodes (even values)
    pub fn is_request(self) -> bool {
        (self as u8) & 1 == 0
    }

    /// True for the routing envelopes wrapping an inner frame
    pub fn is_envelope(self) -> bool {
        matches!(self, Opcode::Unicast | Opcode::Multipath)
    }
}

impl TryFrom<u8> for Opcode {
    type Error = crate::WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Opcode::EchoRequest),
            1 => Ok(Opcode::EchoReply),
            2 => Ok(Opcode::FirmRevRequest),
            3 => Ok(Opcode::FirmRevReply),
            4 => Ok(Opcode::NodeIdRequest),
            5 => Ok(Opcode::NodeIdReply),
            8 => Ok(Opcode::SetTagRequest),
            9 => Ok(Opcode::SetTagReply),
            10 => Ok(Opcode::BindClearRequest),
            11 => Ok(Opcode::BindClearReply),
            12 => Ok(Opcode::SetChannelRequest),
            13 => Ok(Opcode::SetChannelReply),
            14 => Ok(Opcode::NodeConfigRequest),
            15 => Ok(Opcode::NodeConfigReply),
            24 => Ok(Opcode::RebootRequest),
            25 => Ok(Opcode::RebootReply),
            26 => Ok(Opcode::DiscoveryRequest),
            27 => Ok(Opcode::DiscoveryReply),
            30 => Ok(Opcode::FlashRequest),
            31 => Ok(Opcode::FlashReply),
            38 => Ok(Opcode::EntitiesCountRequest),
            39 => Ok(Opcode::EntitiesCountReply),
            40 => Ok(Opcode::EntityHashRequest),
            41 => Ok(Opcode::EntityHashReply),
            42 => Ok(Opcode::GetEntityStateRequest),
            43 => Ok(Opcode::GetEntityStateReply),
            44 => Ok(Opcode::SetEntityStateRequest),
            45 => Ok(Opcode::SetEntityStateReply),
            57 => Ok(Opcode::LogEvent),
            114 => Ok(Opcode::Unicast),
            118 => Ok(Opcode::Multipath),
            122 => Ok(Opcode::ConnectedPathRequest),
            123 => Ok(Opcode::ConnectedPathReply),
            _ => Err(crate::WireError::UnknownFrameType(value)),
        }
    }
}

/// Expected reply opcode for a request opcode: `(opcode & 0xFE) + 1`
pub fn awaited_reply(opcode: u8) -> u8 {
    (opcode & 0xFE).wrapping_add(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_conversion() {
        assert_eq!(Opcode::try_from(0).unwrap(), Opcode::EchoRequest);
        assert_eq!(Opcode::try_from(123).unwrap(), Opcode::ConnectedPathReply);
        assert_eq!(
            Opcode::try_from(6).unwrap_err(),
            crate::WireError::UnknownFrameType(6)
        );
        assert!(Opcode::try_from(0xFF).is_err());
    }

    #[test]
    fn test_awaited_reply_table() {
        let pairs = [
            (Opcode::EchoRequest, Opcode::EchoReply),
            (Opcode::FirmRevRequest, Opcode::FirmRevReply),
            (Opcode::NodeIdRequest, Opcode::NodeIdReply),
            (Opcode::SetTagRequest, Opcode::SetTagReply),
            (Opcode::BindClearRequest, Opcode::BindClearReply),
            (Opcode::SetChannelRequest, Opcode::SetChannelReply),
            (Opcode::NodeConfigRequest, Opcode::NodeConfigReply),
            (Opcode::RebootRequest, Opcode::RebootReply),
            (Opcode::DiscoveryRequest, Opcode::DiscoveryReply),
            (Opcode::FlashRequest, Opcode::FlashReply),
            (Opcode::EntitiesCountRequest, Opcode::EntitiesCountReply),
            (Opcode::EntityHashRequest, Opcode::EntityHashReply),
            (Opcode::GetEntityStateRequest, Opcode::GetEntityStateReply),
            (Opcode::SetEntityStateRequest, Opcode::SetEntityStateReply),
            (Opcode::ConnectedPathRequest, Opcode::ConnectedPathReply),
        ];
        for (request, reply) in pairs {
            assert!(request.is_request());
            assert!(!reply.is_request());
            assert_eq!(awaited_reply(request as u8), reply as u8);
            // A reply opcode maps onto itself
            assert_eq!(awaited_reply(reply as u8), reply as u8);
        }
    }
}
