use lightshow_core::protocol::{
    escape, unescape, FrameEvent, FramingError, MessageType, Packet, PacketBuilder,
    PacketFramer, ProtocolError, MARKER,
};
use pretty_assertions::assert_eq;
use rand::Rng;

fn random_packet(rng: &mut impl Rng) -> Packet {
    let message_type = loop {
        let t: u8 = rng.gen();
        if t != MARKER {
            break t;
        }
    };
    let len = rng.gen_range(0..64);
    // Bias towards the marker byte so escapes are common
    let payload = (0..len)
        .map(|_| if rng.gen_bool(0.25) { MARKER } else { rng.gen() })
        .collect();
    Packet::new(message_type, payload)
}

#[test]
fn test_random_packets_round_trip() {
    let mut rng = rand::thread_rng();
    for _ in 0..500 {
        let packet = random_packet(&mut rng);
        let wire = packet.to_bytes().unwrap();
        assert_eq!(wire.len(), packet.encoded_size());
        assert_eq!(Packet::from_bytes(&wire).unwrap(), packet);
    }
}

#[test]
fn test_no_bare_marker_between_start_and_end() {
    let mut rng = rand::thread_rng();
    for _ in 0..500 {
        let wire = random_packet(&mut rng).to_bytes().unwrap();
        let body = &wire[3..wire.len() - 2];
        let mut i = 0;
        while i < body.len() {
            if body[i] == MARKER {
                assert_eq!(body.get(i + 1), Some(&0xFE), "bare marker in {:02x?}", wire);
                i += 2;
            } else {
                i += 1;
            }
        }
    }
}

#[test]
fn test_escape_unescape_inverse() {
    let mut rng = rand::thread_rng();
    for _ in 0..200 {
        let len = rng.gen_range(0..128);
        let payload: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
        assert_eq!(unescape(&escape(&payload)).unwrap(), payload);
    }
}

#[test]
fn test_stream_of_packets_in_random_chunks() {
    let mut rng = rand::thread_rng();
    let packets: Vec<Packet> = (0..200).map(|_| random_packet(&mut rng)).collect();
    let stream: Vec<u8> = packets
        .iter()
        .flat_map(|p| p.to_bytes().unwrap())
        .collect();

    let mut framer = PacketFramer::new();
    let mut decoded = Vec::new();
    let mut offset = 0;
    while offset < stream.len() {
        let end = (offset + rng.gen_range(1..=50)).min(stream.len());
        for event in framer.push(&stream[offset..end]) {
            match event {
                FrameEvent::Packet(p) => decoded.push(p),
                FrameEvent::Error(e) => panic!("unexpected framing error {e}"),
            }
        }
        offset = end;
    }

    assert_eq!(decoded, packets);
    assert_eq!(framer.buffered_len(), 0);
}

#[test]
fn test_garbage_between_packets_is_skipped() {
    let frame = Packet::new(MessageType::FrameRequest.byte(), vec![8]);
    let mut stream = vec![0x00, 0x12, 0xFF];
    stream.extend(frame.to_bytes().unwrap());
    stream.extend([0x42, 0x43]);
    stream.extend(frame.to_bytes().unwrap());

    let mut framer = PacketFramer::new();
    let events = framer.push(&stream);
    assert_eq!(
        events,
        vec![FrameEvent::Packet(frame.clone()), FrameEvent::Packet(frame)]
    );
}

#[test]
fn test_interrupted_packet_resynchronises() {
    let mut framer = PacketFramer::new();
    let mut stream = vec![0x55, 0xFF, 0x03, 0x01, 0x02];
    stream.extend(Packet::new(0x02, vec![4]).to_bytes().unwrap());

    let events = framer.push(&stream);
    assert_eq!(
        events,
        vec![
            FrameEvent::Error(FramingError::TruncatedPacket),
            FrameEvent::Packet(Packet::new(0x02, vec![4])),
        ]
    );
}

#[test]
fn test_builder_matches_frame_layout() {
    let packet = PacketBuilder::new(MessageType::FrameResponse.byte())
        .u16_be(0x0155)
        .byte(0x55)
        .build();
    assert_eq!(
        packet.to_bytes().unwrap(),
        vec![0x55, 0xFF, 0x03, 0x01, 0x55, 0xFE, 0x55, 0xFE, 0x55, 0x00]
    );
}

#[test]
fn test_reserved_type_is_refused() {
    let err = Packet::new(MARKER, vec![]).to_bytes().unwrap_err();
    assert!(matches!(err, ProtocolError::ReservedMessageType(0x55)));
}
