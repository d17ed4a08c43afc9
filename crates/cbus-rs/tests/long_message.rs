//! Integration tests for the long message protocol, both standalone and
//! driven through the node engine.

mod harness;

use cbus_rs::frame::opcode;
use cbus_rs::longmsg::{
    LongMessage, LongMessageConfig, LongMessageError, LongMessageEx, LongMessageProtocol,
    LongMessageStatus,
};
use cbus_rs::node::NodeConfig;
use cbus_rs::CanFrame;
use harness::{frame_from, new_node, push_rx, take_tx};
use std::cell::RefCell;
use std::rc::Rc;

type Capture = Rc<RefCell<Vec<(Vec<u8>, u8, LongMessageStatus)>>>;

fn capture() -> (Capture, Box<dyn FnMut(&[u8], u8, LongMessageStatus)>) {
    let seen: Capture = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&seen);
    let cb = Box::new(move |data: &[u8], stream: u8, status: LongMessageStatus| {
        sink.borrow_mut().push((data.to_vec(), stream, status));
    });
    (seen, cb)
}

fn crc16(data: &[u8]) -> u16 {
    data.iter().fold(0xFFFF, |mut crc, &b| {
        crc ^= b as u16;
        for _ in 0..8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ 0xA001
            } else {
                crc >> 1
            };
        }
        crc
    })
}

fn header(sender: u8, stream: u8, len: u16, crc: u16, flags: u8) -> CanFrame {
    frame_from(
        sender,
        &[
            opcode::DTXC,
            stream,
            0,
            (len >> 8) as u8,
            len as u8,
            (crc >> 8) as u8,
            crc as u8,
            flags,
        ],
    )
}

fn fragment(sender: u8, stream: u8, seq: u8, chunk: &[u8]) -> CanFrame {
    let mut payload = vec![opcode::DTXC, stream, seq];
    payload.extend_from_slice(chunk);
    frame_from(sender, &payload)
}

fn crc_config() -> LongMessageConfig {
    LongMessageConfig {
        use_crc: true,
        ..LongMessageConfig::default()
    }
}

#[test]
fn sequence_error_aborts_then_clean_stream_completes() {
    let data = b"0123456789ABCDE";
    let crc = crc16(data);
    let (seen, cb) = capture();
    let mut lm = LongMessageEx::new(2, 64, 1, crc_config(), cb);
    lm.subscribe(&[1]);

    // Fragments 0, 1, 3: sequence 2 is skipped.
    lm.handle_fragment(&header(9, 1, data.len() as u16, crc, 1), 0);
    lm.handle_fragment(&fragment(9, 1, 1, &data[..5]), 5);
    lm.handle_fragment(&fragment(9, 1, 3, &data[10..]), 10);
    {
        let seen = seen.borrow();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, data[..5].to_vec());
        assert_eq!(seen[0].2, LongMessageStatus::SequenceError);
    }
    seen.borrow_mut().clear();

    // The context was released; a fresh, well-sequenced stream completes.
    lm.handle_fragment(&header(9, 1, data.len() as u16, crc, 1), 20);
    lm.handle_fragment(&fragment(9, 1, 1, &data[..5]), 25);
    lm.handle_fragment(&fragment(9, 1, 2, &data[5..10]), 30);
    lm.handle_fragment(&fragment(9, 1, 3, &data[10..]), 35);
    let seen = seen.borrow();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].0, data.to_vec());
    assert_eq!(seen[0].1, 1);
    assert_eq!(seen[0].2, LongMessageStatus::Complete);
}

#[test]
fn crc_mismatch_is_reported() {
    let data = b"payload";
    let (seen, cb) = capture();
    let mut lm = LongMessageEx::new(1, 32, 1, crc_config(), cb);
    lm.subscribe(&[4]);

    lm.handle_fragment(&header(9, 4, data.len() as u16, 0xDEAD, 1), 0);
    lm.handle_fragment(&fragment(9, 4, 1, &data[..5]), 5);
    lm.handle_fragment(&fragment(9, 4, 2, &data[5..]), 10);

    let seen = seen.borrow();
    assert_eq!(seen[0].2, LongMessageStatus::CrcError);
    assert_eq!(seen[0].0, data.to_vec());
}

#[test]
fn idle_stream_times_out() {
    let (seen, cb) = capture();
    let mut lm = LongMessageEx::new(1, 32, 1, LongMessageConfig::default(), cb);
    lm.subscribe(&[2]);

    lm.handle_fragment(&header(9, 2, 10, 0, 0), 0);
    lm.handle_fragment(&fragment(9, 2, 1, b"abcde"), 100);
    lm.tick(4_000);
    assert!(seen.borrow().is_empty());

    lm.tick(5_100);
    let seen = seen.borrow();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].0, b"abcde".to_vec());
    assert_eq!(seen[0].2, LongMessageStatus::TimeoutError);
}

#[test]
fn oversized_declaration_is_truncated() {
    let (seen, cb) = capture();
    let mut lm = LongMessageEx::new(1, 32, 1, LongMessageConfig::default(), cb);
    lm.subscribe(&[2]);

    lm.handle_fragment(&header(9, 2, 100, 0, 0), 0);
    let seen = seen.borrow();
    assert_eq!(seen[0].2, LongMessageStatus::Truncated);
    assert!(seen[0].0.is_empty());
}

#[test]
fn receive_pool_exhaustion_is_reported() {
    let (seen, cb) = capture();
    let mut lm = LongMessageEx::new(1, 32, 1, LongMessageConfig::default(), cb);
    lm.subscribe(&[1, 2]);

    lm.handle_fragment(&header(9, 1, 10, 0, 0), 0);
    lm.handle_fragment(&header(10, 2, 10, 0, 0), 5);

    let seen = seen.borrow();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].1, 2);
    assert_eq!(seen[0].2, LongMessageStatus::InternalError);
}

#[test]
fn unsubscribed_streams_are_ignored() {
    let (seen, cb) = capture();
    let mut lm = LongMessageEx::new(1, 32, 1, LongMessageConfig::default(), cb);
    lm.subscribe(&[1]);

    lm.handle_fragment(&header(9, 3, 5, 0, 0), 0);
    lm.handle_fragment(&fragment(9, 3, 1, b"abcde"), 5);
    assert!(seen.borrow().is_empty());
}

#[test]
fn fragments_are_paced_by_the_configured_delay() {
    let (_seen, cb) = capture();
    let mut lm = LongMessageEx::new(1, 32, 1, LongMessageConfig::default(), cb);

    lm.send_message(b"HELLOWORLD", 3, 0x0B).unwrap();
    let (head, priority) = lm.poll_transmit(0).unwrap();
    assert_eq!(priority, 0x0B);
    assert_eq!(head.payload(), &[opcode::DTXC, 3, 0, 0, 10, 0, 0, 0]);

    // Within the inter-fragment delay nothing is due.
    assert!(lm.poll_transmit(0).is_none());
    assert!(lm.poll_transmit(19).is_none());

    let (f1, _) = lm.poll_transmit(20).unwrap();
    assert_eq!(f1.payload(), &[opcode::DTXC, 3, 1, b'H', b'E', b'L', b'L', b'O']);
    let (f2, _) = lm.poll_transmit(40).unwrap();
    assert_eq!(f2.payload(), &[opcode::DTXC, 3, 2, b'W', b'O', b'R', b'L', b'D']);
    assert!(!lm.is_sending());
}

#[test]
fn send_context_accounting() {
    let (_seen, cb) = capture();
    let mut lm = LongMessageEx::new(1, 32, 1, LongMessageConfig::default(), cb);

    lm.send_message(b"one", 1, 0x0B).unwrap();
    assert_eq!(
        lm.send_message(b"again", 1, 0x0B),
        Err(LongMessageError::StreamBusy)
    );
    assert_eq!(
        lm.send_message(b"two", 2, 0x0B),
        Err(LongMessageError::NoFreeContext)
    );
}

fn sent_stream_order(sequential: bool) -> Vec<u8> {
    let (_seen, cb) = capture();
    let config = LongMessageConfig {
        sequential,
        ..LongMessageConfig::default()
    };
    let mut lm = LongMessageEx::new(1, 32, 2, config, cb);
    lm.send_message(b"AAAAAAAAAA", 1, 0x0B).unwrap();
    lm.send_message(b"BBBBBBBBBB", 2, 0x0B).unwrap();

    let mut order = Vec::new();
    let mut now = 0;
    while lm.is_sending() {
        while let Some((frame, _)) = lm.poll_transmit(now) {
            order.push(frame.payload()[1]);
        }
        now += 20;
    }
    order
}

#[test]
fn sequential_sends_run_one_stream_to_completion() {
    assert_eq!(sent_stream_order(true), vec![1, 1, 1, 2, 2, 2]);
}

#[test]
fn concurrent_sends_interleave_fragment_by_fragment() {
    assert_eq!(sent_stream_order(false), vec![1, 2, 1, 2, 1, 2]);
}

#[test]
fn single_context_flushes_when_its_buffer_fills() {
    let data = b"0123456789";
    let (seen, cb) = capture();
    let mut lm = LongMessage::new(4, 32, LongMessageConfig::default(), cb);
    lm.subscribe(&[6]);

    lm.handle_fragment(&header(9, 6, data.len() as u16, 0, 0), 0);
    lm.handle_fragment(&fragment(9, 6, 1, &data[..5]), 5);
    lm.handle_fragment(&fragment(9, 6, 2, &data[5..]), 10);

    let seen = seen.borrow();
    let statuses: Vec<_> = seen.iter().map(|(d, _, s)| (d.len(), *s)).collect();
    assert_eq!(
        statuses,
        vec![
            (4, LongMessageStatus::Incomplete),
            (4, LongMessageStatus::Incomplete),
            (2, LongMessageStatus::Complete),
        ]
    );
    assert_eq!(seen[2].0, b"89".to_vec());
}

#[test]
fn single_context_rejects_oversized_sends() {
    let (_seen, cb) = capture();
    let mut lm = LongMessage::new(16, 8, LongMessageConfig::default(), cb);
    assert_eq!(
        lm.send_message(b"far too long for it", 1, 0x0B),
        Err(LongMessageError::MessageTooLong)
    );
}

#[test]
fn node_forwards_fragments_to_the_registered_handler() {
    let (mut node, bus) = new_node(0x0102, 5, NodeConfig::default());
    let (seen, cb) = capture();
    let mut lm = LongMessageEx::new(2, 64, 1, LongMessageConfig::default(), cb);
    lm.subscribe(&[7]);
    node.set_long_message_handler(Box::new(lm));

    let data = b"stream via node";
    push_rx(&bus, header(9, 7, data.len() as u16, 0, 0));
    push_rx(&bus, fragment(9, 7, 1, &data[..5]));
    push_rx(&bus, fragment(9, 7, 2, &data[5..10]));
    push_rx(&bus, fragment(9, 7, 3, &data[10..]));
    // Four frames exceed the per-call drain limit, so two passes.
    node.process(0).unwrap();
    node.process(10).unwrap();

    let seen = seen.borrow();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].0, data.to_vec());
    assert_eq!(seen[0].2, LongMessageStatus::Complete);
}

#[test]
fn node_sends_long_messages_through_the_driving_loop() {
    let (mut node, bus) = new_node(0x0102, 5, NodeConfig::default());
    let (_seen, cb) = capture();
    let lm = LongMessageEx::new(1, 32, 1, LongMessageConfig::default(), cb);
    node.set_long_message_handler(Box::new(lm));

    node.send_long_message(b"HI!", 7, 0x0B, 0).unwrap();
    let tx = take_tx(&bus);
    assert_eq!(tx.len(), 1);
    assert_eq!(tx[0].payload(), &[opcode::DTXC, 7, 0, 0, 3, 0, 0, 0]);
    assert_eq!(tx[0].can_id(), 5);

    node.process(20).unwrap();
    let tx = take_tx(&bus);
    assert_eq!(tx.len(), 1);
    assert_eq!(tx[0].payload(), &[opcode::DTXC, 7, 1, b'H', b'I', b'!']);
}

#[test]
fn sending_without_a_handler_fails() {
    let (mut node, _bus) = new_node(0x0102, 5, NodeConfig::default());
    assert!(node.send_long_message(b"x", 1, 0x0B, 0).is_err());
}
