//! Property tests for the frame layout

use bytes::Bytes;
use proptest::prelude::*;
use skmesh_wire::frame::{decode_header, encode_header};
use skmesh_wire::{Frame, HEADER_LEN};

proptest! {
    #[test]
    fn frame_decode_inverts_encode(
        module_id in any::<u16>(),
        message_id in any::<u16>(),
        body in proptest::collection::vec(any::<u8>(), 0..4096),
    ) {
        let frame = Frame::new(module_id, message_id, Bytes::from(body.clone()));
        let buf = frame.encode().unwrap();

        prop_assert_eq!(buf.len(), HEADER_LEN + body.len());
        prop_assert_eq!(decode_header(&buf), (module_id, message_id, body.len() as u32));
        prop_assert_eq!(Frame::decode(&buf).unwrap(), frame);
    }

    #[test]
    fn header_fields_are_little_endian(
        module_id in any::<u16>(),
        message_id in any::<u16>(),
        body_len in any::<u32>(),
    ) {
        let header = encode_header(module_id, message_id, body_len);
        prop_assert_eq!(&header[0..2], &module_id.to_le_bytes()[..]);
        prop_assert_eq!(&header[2..4], &message_id.to_le_bytes()[..]);
        prop_assert_eq!(&header[4..8], &body_len.to_le_bytes()[..]);
    }
}
