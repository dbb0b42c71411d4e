//! Send-path tests: a real publication draining a mapped log onto a
//! localhost UDP socket, with the clock under test control.

use std::{io, net::UdpSocket, sync::Arc, time::Duration};

use weir::{
    DriverContext,
    driver::{
        endpoint::{SendChannelEndpoint, UdpChannel},
        flow_control::UnicastFlowControl,
        publication::{NetworkPublication, PublicationParams},
    },
    logbuffer::set_frame_length_release,
    protocol::{
        DATA_HEADER_LENGTH, DataFlags, DataHeader, FrameHeader, HDR_TYPE_DATA, HDR_TYPE_RTTM,
        HDR_TYPE_SETUP, HDR_TYPE_SM, RTTM_HEADER_LENGTH, RttmFlags, RttmHeader,
        STATUS_MESSAGE_LENGTH, SetupHeader, StatusMessage,
    },
};
use weir_concurrent::{CountersManager, Position, SystemCounters};
use weir_timing::{Clocks, Mock, Nanos};

const TERM_LENGTH: usize = 64 * 1024;
const MTU: usize = 1408;

struct TestPublication {
    _dir: tempfile::TempDir,
    receiver: UdpSocket,
    clocks: Clocks,
    mock: Arc<Mock>,
    counters: SystemCounters,
    initial_term_id: i32,
    snd_pos: Position,
    snd_lmt: Position,
    publication: NetworkPublication,
}

impl TestPublication {
    fn new(initial_term_id: i32) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        receiver.set_nonblocking(true).unwrap();

        let (clocks, mock) = Clocks::mocked();
        let context = DriverContext {
            dir: dir.path().to_path_buf(),
            term_buffer_length: TERM_LENGTH,
            mtu_length: MTU,
            clocks: clocks.clone(),
            ..Default::default()
        };

        let endpoint = Arc::new(
            SendChannelEndpoint::new(UdpChannel::unicast(receiver.local_addr().unwrap())).unwrap(),
        );

        let mut manager = CountersManager::new();
        let pub_lmt = manager.allocate("pub-lmt");
        let snd_pos = manager.allocate("snd-pos");
        let snd_lmt = manager.allocate("snd-lmt");
        let counters = SystemCounters::new();

        let params = PublicationParams {
            registration_id: 1,
            session_id: 11,
            stream_id: 1001,
            initial_term_id,
            term_buffer_length: TERM_LENGTH,
            mtu_length: MTU,
            is_exclusive: false,
        };
        let publication = NetworkPublication::create(
            &context,
            endpoint,
            &params,
            pub_lmt,
            snd_pos.clone(),
            snd_lmt.clone(),
            Box::new(UnicastFlowControl),
            &counters,
        )
        .unwrap();

        Self {
            _dir: dir,
            receiver,
            clocks,
            mock,
            counters,
            initial_term_id,
            snd_pos,
            snd_lmt,
            publication,
        }
    }

    fn now(&self) -> Nanos {
        self.clocks.nano_time()
    }

    fn advance(&self, by: Nanos) {
        self.mock.increment(by.0 as u64);
    }

    fn tick(&self) -> usize {
        self.publication.send(self.now()).unwrap()
    }

    /// Wait briefly for one datagram.
    fn recv_frame(&self) -> Option<Vec<u8>> {
        let mut buf = [0u8; 2048];
        for _ in 0..200 {
            match self.receiver.recv(&mut buf) {
                Ok(n) => return Some(buf[..n].to_vec()),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_micros(500));
                }
                Err(e) => panic!("recv: {e}"),
            }
        }
        None
    }

    fn recv_all(&self) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        while let Some(frame) = self.recv_frame() {
            frames.push(frame);
        }
        frames
    }

    fn assert_silence(&self) {
        std::thread::sleep(Duration::from_millis(20));
        let mut buf = [0u8; 2048];
        match self.receiver.recv(&mut buf) {
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Ok(n) => panic!("unexpected {n}-byte datagram"),
            Err(e) => panic!("recv: {e}"),
        }
    }

    /// Lay a committed data frame of `frame_length` bytes (header included)
    /// into the active term, the way a producer would.
    fn commit_frame(&self, term_index: usize, term_offset: usize, frame_length: usize) {
        assert!(frame_length >= DATA_HEADER_LENGTH && frame_length % 8 == 0);
        let term = unsafe { self.publication.log().term_mut(term_index) };
        DataHeader {
            frame_header: FrameHeader::new(
                0,
                (DataFlags::BEGIN | DataFlags::END).bits(),
                HDR_TYPE_DATA,
            ),
            term_offset: term_offset as i32,
            session_id: 11,
            stream_id: 1001,
            term_id: self.initial_term_id,
            reserved_value: 0,
        }
        .encode(&mut term[term_offset..]);
        for b in &mut term[term_offset + DATA_HEADER_LENGTH..term_offset + frame_length] {
            *b = 0xAB;
        }
        set_frame_length_release(term, term_offset, frame_length as i32);
    }

    fn status_message(&self, term_id: i32, term_offset: i32, window: i32) -> StatusMessage {
        StatusMessage {
            frame_header: FrameHeader::new(STATUS_MESSAGE_LENGTH as i32, 0, HDR_TYPE_SM),
            session_id: 11,
            stream_id: 1001,
            consumption_term_id: term_id,
            consumption_term_offset: term_offset,
            receiver_window: window,
            receiver_id: 7,
        }
    }

    fn connect(&self, term_id: i32, window: i32) {
        let sm = self.status_message(term_id, 0, window);
        self.publication.on_status_message(&sm, self.receiver.local_addr().unwrap());
    }
}

fn frame_type(frame: &[u8]) -> u16 {
    FrameHeader::decode(frame).unwrap().frame_type
}

#[test]
fn basic_send() {
    let t = TestPublication::new(7);
    t.connect(7, 4096);
    t.commit_frame(0, 0, 1024);

    let sent = t.tick();
    assert_eq!(sent, 1024);
    assert_eq!(t.snd_pos.get_volatile(), 1024);
    assert_eq!(t.counters.short_sends.get(), 0);

    let frames = t.recv_all();
    let data: Vec<_> = frames.iter().filter(|f| frame_type(f) == HDR_TYPE_DATA).collect();
    assert_eq!(data.len(), 1);
    assert_eq!(data[0].len(), 1024);

    let header = DataHeader::decode(data[0]).unwrap();
    assert_eq!(header.frame_header.frame_length, 1024);
    assert_eq!(header.term_offset, 0);
    assert_eq!(header.session_id, 11);
    assert_eq!(header.stream_id, 1001);
    assert_eq!(data[0][DATA_HEADER_LENGTH], 0xAB);
}

#[test]
fn batches_at_most_two_datagrams_per_tick() {
    let t = TestPublication::new(0);
    t.connect(0, 8192);
    for i in 0..8 {
        t.commit_frame(0, i * 1024, 1024);
    }

    // 1024-byte frames: two fit under the MTU scan limit per datagram pair.
    assert_eq!(t.tick(), 2048);
    assert_eq!(t.snd_pos.get_volatile(), 2048);

    t.advance(Nanos::from_millis(1));
    assert_eq!(t.tick(), 2048);
    t.advance(Nanos::from_millis(1));
    assert_eq!(t.tick(), 2048);
    t.advance(Nanos::from_millis(1));
    assert_eq!(t.tick(), 2048);
    assert_eq!(t.snd_pos.get_volatile(), 8192);

    t.advance(Nanos::from_millis(1));
    assert_eq!(t.tick(), 0);
}

#[test]
fn flow_control_stall_heartbeats_and_counts_once() {
    let t = TestPublication::new(0);
    t.commit_frame(0, 0, 1024);
    t.commit_frame(0, 1024, 1024);

    // The receiver connects with a closed window: no data moves, and the
    // stall is counted exactly once.
    t.connect(0, 0);
    assert_eq!(t.tick(), 0);
    assert_eq!(t.counters.heartbeats_sent.get(), 0);
    assert_eq!(t.counters.sender_flow_control_limits.get(), 1);

    // Still stalled within the heartbeat window: nothing more, and the limit
    // counter does not run away.
    t.advance(Nanos::from_millis(1));
    assert_eq!(t.tick(), 0);
    assert_eq!(t.counters.heartbeats_sent.get(), 0);
    assert_eq!(t.counters.sender_flow_control_limits.get(), 1);

    // The second tick past the heartbeat timeout keeps the stream alive.
    t.advance(Nanos::from_millis(101));
    assert_eq!(t.tick(), DATA_HEADER_LENGTH);
    assert_eq!(t.counters.heartbeats_sent.get(), 1);
    assert_eq!(t.counters.sender_flow_control_limits.get(), 1);

    // Flow control opens the window: data goes out and the stall accounting
    // rearms.
    t.connect(0, 4096);
    t.advance(Nanos::from_millis(1));
    assert_eq!(t.tick(), 2048);
    assert_eq!(t.counters.sender_flow_control_limits.get(), 1);
}

#[test]
fn setup_cadence_until_connected() {
    let t = TestPublication::new(3);

    t.tick();
    let frames = t.recv_all();
    assert_eq!(frames.iter().filter(|f| frame_type(f) == HDR_TYPE_SETUP).count(), 1);

    let setup = SetupHeader::decode(
        frames.iter().find(|f| frame_type(f) == HDR_TYPE_SETUP).unwrap(),
    )
    .unwrap();
    assert_eq!(setup.initial_term_id, 3);
    assert_eq!(setup.active_term_id, 3);
    assert_eq!(setup.term_length, TERM_LENGTH as i32);
    assert_eq!(setup.mtu, MTU as i32);

    // Within the setup timeout: quiet.
    t.advance(Nanos::from_millis(1));
    t.tick();
    t.assert_silence();

    // Past it: another setup.
    t.advance(Nanos::from_millis(101));
    t.tick();
    let frames = t.recv_all();
    assert_eq!(frames.iter().filter(|f| frame_type(f) == HDR_TYPE_SETUP).count(), 1);

    // A status message connects the publication; no more setups.
    t.connect(3, 4096);
    assert!(t.publication.is_connected());
    t.advance(Nanos::from_millis(1));
    t.tick();
    assert!(t.recv_all().iter().all(|f| frame_type(f) != HDR_TYPE_SETUP));
}

#[test]
fn nak_triggers_exactly_one_retransmission() {
    let t = TestPublication::new(7);
    t.connect(7, 8192);
    for i in 0..8 {
        t.commit_frame(0, i * 1024, 1024);
    }
    while t.snd_pos.get_volatile() < 8192 {
        t.advance(Nanos::from_millis(1));
        t.tick();
    }
    t.recv_all();

    t.publication.on_nak(7, 2048, 1024);
    t.advance(Nanos::from_millis(1));
    t.tick();

    let frames = t.recv_all();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].len(), 1024);
    let header = DataHeader::decode(&frames[0]).unwrap();
    assert_eq!(header.term_offset, 2048);
    assert_eq!(t.counters.retransmits_sent.get(), 1);

    // A duplicate inside the linger window is absorbed.
    t.publication.on_nak(7, 2048, 1024);
    t.advance(Nanos::from_millis(1));
    t.tick();
    t.assert_silence();
    assert_eq!(t.counters.retransmits_sent.get(), 1);

    // Once the linger expires the range can be asked for again.
    t.advance(Nanos::from_millis(101));
    t.tick();
    t.recv_all(); // idle heartbeat
    t.publication.on_nak(7, 2048, 1024);
    t.advance(Nanos::from_millis(1));
    t.tick();
    assert_eq!(t.counters.retransmits_sent.get(), 2);
    assert_eq!(t.recv_all().len(), 1);
}

#[test]
fn nak_outside_the_log_is_ignored() {
    let t = TestPublication::new(7);
    t.connect(7, 4096);
    t.commit_frame(0, 0, 1024);
    t.tick();
    t.recv_all();

    // Not yet sent.
    t.publication.on_nak(7, 2048, 1024);
    // Aged out: a full term behind.
    t.publication.on_nak(6, 0, 1024);
    t.advance(Nanos::from_millis(1));
    t.tick();
    t.assert_silence();
    assert_eq!(t.counters.retransmits_sent.get(), 0);

    // Garbage offsets count as invalid packets.
    t.publication.on_nak(7, -16, 1024);
    t.publication.on_nak(7, 0, -1);
    assert_eq!(t.counters.invalid_packets.get(), 2);
}

#[test]
fn rttm_reply_echoes_the_probe() {
    let t = TestPublication::new(0);

    let probe = RttmHeader {
        frame_header: FrameHeader::new(
            RTTM_HEADER_LENGTH as i32,
            RttmFlags::REPLY.bits(),
            HDR_TYPE_RTTM,
        ),
        session_id: 11,
        stream_id: 1001,
        echo_timestamp: 123_456_789,
        reception_delta: 55,
        receiver_id: 42,
    };
    t.publication.on_rttm(&probe).unwrap();

    let frame = t.recv_frame().expect("rttm reply");
    let reply = RttmHeader::decode(&frame).unwrap();
    assert_eq!(reply.frame_header.frame_type, HDR_TYPE_RTTM);
    assert_eq!(reply.echo_timestamp, 123_456_789);
    assert_eq!(reply.receiver_id, 42);
    assert_eq!(reply.reception_delta, 0);
    assert!(!reply.is_reply_requested());

    // Without the reply flag the probe is dropped on the floor.
    let silent = RttmHeader { frame_header: FrameHeader::new(RTTM_HEADER_LENGTH as i32, 0, HDR_TYPE_RTTM), ..probe };
    t.publication.on_rttm(&silent).unwrap();
    t.assert_silence();
}

#[test]
fn sender_limit_follows_status_messages() {
    let t = TestPublication::new(0);
    t.connect(0, 4096);
    assert_eq!(t.snd_lmt.get_volatile(), 4096);

    // Receiver has consumed 2 KiB and re-advertises its window.
    let sm = t.status_message(0, 2048, 4096);
    t.publication.on_status_message(&sm, t.receiver.local_addr().unwrap());
    assert_eq!(t.snd_lmt.get_volatile(), 6144);
}
