use std::{
    io::{self, IoSlice},
    net::SocketAddr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicI64, Ordering},
    },
};

use tracing::{debug, warn};
use weir_concurrent::{Counter, CountersManager, Position, ReadablePosition, SystemCounters};
use weir_timing::{Clocks, Nanos};

use crate::{
    context::{DriverContext, validate_mtu, validate_term_length},
    driver::{
        DriverConductor,
        endpoint::SendChannelEndpoint,
        flow_control::FlowControl,
        retransmit::{RETRANSMIT_LINGER_TIMEOUT, RetransmitHandler},
    },
    error::DriverError,
    logbuffer::{
        MappedRawLog, compute_position, compute_term_id_from_position, index_by_position,
        position_bits_to_shift, scan_for_availability,
    },
    protocol::{
        DATA_HEADER_LENGTH, DataFlags, DataHeader, FrameHeader, HDR_TYPE_DATA, HDR_TYPE_RTTM,
        HDR_TYPE_SETUP, RTTM_HEADER_LENGTH, RttmHeader, SETUP_HEADER_LENGTH, SetupHeader,
        StatusMessage,
    },
};

/// Data datagrams batched into one gather send per tick.
pub const MAX_MESSAGES_PER_SEND: usize = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PublicationStatus {
    Active,
    Draining,
    Linger,
    Closing,
}

/// Identity and geometry of a new publication.
#[derive(Clone, Debug)]
pub struct PublicationParams {
    pub registration_id: i64,
    pub session_id: i32,
    pub stream_id: i32,
    pub initial_term_id: i32,
    pub term_buffer_length: usize,
    pub mtu_length: usize,
    pub is_exclusive: bool,
}

/// State only the conductor thread touches.
struct ConductorState {
    status: PublicationStatus,
    refcnt: i32,
    clean_position: i64,
    last_snd_pos: i64,
    time_of_last_activity: Nanos,
    time_of_last_status_change: Nanos,
    spy_positions: Vec<ReadablePosition>,
}

/// The per-stream sender-side state machine.
///
/// The sender thread drives [`send`](Self::send) and the resends it spawns;
/// the conductor thread drives intake ([`on_status_message`](Self::on_status_message),
/// [`on_nak`](Self::on_nak), [`on_rttm`](Self::on_rttm)),
/// [`update_pub_lmt`](Self::update_pub_lmt) and
/// [`on_time_event`](Self::on_time_event). Cross-thread scalars are atomics
/// with acquire/release pairing; everything conductor-only sits in a mutex
/// that one thread locks.
pub struct NetworkPublication {
    registration_id: i64,
    session_id: i32,
    stream_id: i32,
    initial_term_id: i32,
    term_length_mask: i32,
    position_bits_to_shift: u32,
    mtu_length: usize,
    term_window_length: i64,
    linger_timeout: Nanos,
    connection_timeout_ms: i64,
    heartbeat_timeout: Nanos,
    setup_timeout: Nanos,
    is_exclusive: bool,
    clocks: Clocks,

    log: MappedRawLog,
    endpoint: Arc<SendChannelEndpoint>,
    flow_control: Mutex<Box<dyn FlowControl>>,
    retransmit: Mutex<RetransmitHandler>,

    pub_lmt: Position,
    snd_pos: Position,
    snd_lmt: Position,

    time_of_last_send_or_heartbeat: AtomicI64,
    time_of_last_setup: AtomicI64,
    should_send_setup_frame: AtomicBool,
    track_sender_limits: AtomicBool,
    is_connected: AtomicBool,
    is_complete: AtomicBool,
    has_sender_released: AtomicBool,

    short_sends: Counter,
    heartbeats_sent: Counter,
    sender_flow_control_limits: Counter,
    retransmits_sent: Counter,

    conductor: Mutex<ConductorState>,
}

impl NetworkPublication {
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        context: &DriverContext,
        endpoint: Arc<SendChannelEndpoint>,
        params: &PublicationParams,
        pub_lmt: Position,
        snd_pos: Position,
        snd_lmt: Position,
        flow_control: Box<dyn FlowControl>,
        system_counters: &SystemCounters,
    ) -> Result<Self, DriverError> {
        validate_term_length(params.term_buffer_length)?;
        validate_mtu(params.mtu_length)?;

        std::fs::create_dir_all(context.publications_dir())?;
        let log_length = MappedRawLog::log_length(params.term_buffer_length) as u64;
        if (context.usable_space)(&context.dir) < log_length {
            return Err(DriverError::InsufficientSpace {
                needed: log_length,
                dir: context.dir.clone(),
            });
        }

        let path = context.log_file_path(
            endpoint.channel().canonical_form(),
            params.session_id,
            params.stream_id,
            params.registration_id,
        );

        let mut default_frame_header = [0u8; DATA_HEADER_LENGTH];
        DataHeader {
            frame_header: FrameHeader::new(
                0,
                (DataFlags::BEGIN | DataFlags::END).bits(),
                HDR_TYPE_DATA,
            ),
            term_offset: 0,
            session_id: params.session_id,
            stream_id: params.stream_id,
            term_id: params.initial_term_id,
            reserved_value: 0,
        }
        .encode(&mut default_frame_header);

        let log = MappedRawLog::create(
            &path,
            params.term_buffer_length,
            params.initial_term_id,
            params.mtu_length as i32,
            params.registration_id,
            &default_frame_header,
        )?;

        let now = context.clocks.nano_time();
        debug!(
            registration_id = params.registration_id,
            session_id = params.session_id,
            stream_id = params.stream_id,
            channel = endpoint.channel().canonical_form(),
            "created network publication"
        );

        Ok(Self {
            registration_id: params.registration_id,
            session_id: params.session_id,
            stream_id: params.stream_id,
            initial_term_id: params.initial_term_id,
            term_length_mask: params.term_buffer_length as i32 - 1,
            position_bits_to_shift: position_bits_to_shift(params.term_buffer_length),
            mtu_length: params.mtu_length,
            term_window_length: context.term_window_length(params.term_buffer_length),
            linger_timeout: context.publication_linger_timeout,
            connection_timeout_ms: context.connection_timeout.as_millis(),
            heartbeat_timeout: context.heartbeat_timeout,
            setup_timeout: context.setup_timeout,
            is_exclusive: params.is_exclusive,
            clocks: context.clocks.clone(),
            log,
            endpoint,
            flow_control: Mutex::new(flow_control),
            retransmit: Mutex::new(RetransmitHandler::new(
                system_counters.invalid_packets.clone(),
                Nanos::ZERO,
                RETRANSMIT_LINGER_TIMEOUT,
            )),
            pub_lmt,
            snd_pos,
            snd_lmt,
            // Back-dated so the first tick emits setup and heartbeat at once.
            time_of_last_send_or_heartbeat: AtomicI64::new(
                (now - context.heartbeat_timeout - Nanos(1)).0,
            ),
            time_of_last_setup: AtomicI64::new((now - context.setup_timeout - Nanos(1)).0),
            should_send_setup_frame: AtomicBool::new(true),
            track_sender_limits: AtomicBool::new(true),
            is_connected: AtomicBool::new(false),
            is_complete: AtomicBool::new(false),
            has_sender_released: AtomicBool::new(false),
            short_sends: system_counters.short_sends.clone(),
            heartbeats_sent: system_counters.heartbeats_sent.clone(),
            sender_flow_control_limits: system_counters.sender_flow_control_limits.clone(),
            retransmits_sent: system_counters.retransmits_sent.clone(),
            conductor: Mutex::new(ConductorState {
                status: PublicationStatus::Active,
                refcnt: 1,
                clean_position: 0,
                last_snd_pos: 0,
                time_of_last_activity: Nanos::ZERO,
                time_of_last_status_change: Nanos::ZERO,
                spy_positions: Vec::new(),
            }),
        })
    }

    #[inline]
    pub fn registration_id(&self) -> i64 {
        self.registration_id
    }

    #[inline]
    pub fn session_id(&self) -> i32 {
        self.session_id
    }

    #[inline]
    pub fn stream_id(&self) -> i32 {
        self.stream_id
    }

    #[inline]
    pub fn is_exclusive(&self) -> bool {
        self.is_exclusive
    }

    #[inline]
    fn term_length(&self) -> usize {
        (self.term_length_mask + 1) as usize
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.is_connected.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_complete(&self) -> bool {
        self.is_complete.load(Ordering::Acquire)
    }

    pub fn log(&self) -> &MappedRawLog {
        &self.log
    }

    pub fn status(&self) -> PublicationStatus {
        self.conductor.lock().unwrap().status
    }

    pub fn clean_position(&self) -> i64 {
        self.conductor.lock().unwrap().clean_position
    }

    /// When the publication last changed lifecycle status; the conductor uses
    /// this for client-liveness accounting.
    pub fn time_of_last_status_change(&self) -> Nanos {
        self.conductor.lock().unwrap().time_of_last_status_change
    }

    /// One sender-thread tick: setup, data, heartbeat, flow-control idle,
    /// retransmit timeouts. Returns the payload bytes put on the wire.
    pub fn send(&self, now: Nanos) -> Result<usize, DriverError> {
        let snd_pos = self.snd_pos.get();
        let active_term_id =
            compute_term_id_from_position(snd_pos, self.position_bits_to_shift, self.initial_term_id);
        let term_offset = (snd_pos & i64::from(self.term_length_mask)) as i32;

        if self.should_send_setup_frame.load(Ordering::Acquire) {
            self.setup_message_check(now, active_term_id, term_offset)?;
        }

        let mut bytes_sent = self.send_data(now, snd_pos, term_offset)?;

        if bytes_sent == 0 {
            bytes_sent = self.heartbeat_message_check(now, active_term_id, term_offset)?;

            let snd_lmt = self.snd_lmt.get();
            let flow_control_position = self.flow_control.lock().unwrap().on_idle(now, snd_lmt);
            self.snd_lmt.set_release(flow_control_position);
        }

        self.retransmit
            .lock()
            .unwrap()
            .process_timeouts(now, |term_id, term_offset, length| {
                self.resend(term_id, term_offset, length)
            })?;

        Ok(bytes_sent)
    }

    fn setup_message_check(
        &self,
        now: Nanos,
        active_term_id: i32,
        term_offset: i32,
    ) -> Result<(), DriverError> {
        if now > Nanos(self.time_of_last_setup.load(Ordering::Relaxed)) + self.setup_timeout {
            let mut buf = [0u8; SETUP_HEADER_LENGTH];
            SetupHeader {
                frame_header: FrameHeader::new(SETUP_HEADER_LENGTH as i32, 0, HDR_TYPE_SETUP),
                term_offset,
                session_id: self.session_id,
                stream_id: self.stream_id,
                initial_term_id: self.initial_term_id,
                active_term_id,
                term_length: self.term_length() as i32,
                mtu: self.mtu_length as i32,
                ttl: i32::from(self.endpoint.channel().multicast_ttl()),
            }
            .encode(&mut buf);

            self.send_control_frame(&buf)?;
            self.time_of_last_setup.store(now.0, Ordering::Relaxed);
            self.time_of_last_send_or_heartbeat.store(now.0, Ordering::Relaxed);

            if self.is_connected.load(Ordering::Acquire) {
                self.should_send_setup_frame.store(false, Ordering::Release);
            }
        }
        Ok(())
    }

    fn heartbeat_message_check(
        &self,
        now: Nanos,
        active_term_id: i32,
        term_offset: i32,
    ) -> Result<usize, DriverError> {
        let mut bytes_sent = 0;
        if now
            > Nanos(self.time_of_last_send_or_heartbeat.load(Ordering::Relaxed))
                + self.heartbeat_timeout
        {
            let mut flags = DataFlags::BEGIN | DataFlags::END;
            if self.is_complete.load(Ordering::Acquire) {
                flags |= DataFlags::EOS;
            }

            let mut buf = [0u8; DATA_HEADER_LENGTH];
            DataHeader {
                frame_header: FrameHeader::new(0, flags.bits(), HDR_TYPE_DATA),
                term_offset,
                session_id: self.session_id,
                stream_id: self.stream_id,
                term_id: active_term_id,
                reserved_value: 0,
            }
            .encode(&mut buf);

            self.send_control_frame(&buf)?;
            bytes_sent = DATA_HEADER_LENGTH;
            self.heartbeats_sent.increment_release();
            self.time_of_last_send_or_heartbeat.store(now.0, Ordering::Relaxed);
        }
        Ok(bytes_sent)
    }

    fn send_data(&self, now: Nanos, snd_pos: i64, term_offset: i32) -> Result<usize, DriverError> {
        let term_length = self.term_length();
        let mut available_window = self.snd_lmt.get_volatile() - snd_pos;
        let mut highest_pos = snd_pos;
        let mut term_offset = term_offset as usize;
        let mut bytes_sent = 0;

        let index = index_by_position(snd_pos, self.position_bits_to_shift);
        let term = self.log.term(index);

        let mut frames: [IoSlice<'_>; MAX_MESSAGES_PER_SEND] =
            [IoSlice::new(&[]); MAX_MESSAGES_PER_SEND];
        let mut vlen = 0;

        for _ in 0..MAX_MESSAGES_PER_SEND {
            if available_window <= 0 {
                break;
            }
            let scan_limit = (available_window as usize).min(self.mtu_length);
            let (available, padding) = scan_for_availability(&term[term_offset..], scan_limit);

            if available > 0 {
                frames[vlen] = IoSlice::new(&term[term_offset..term_offset + available]);
                vlen += 1;

                bytes_sent += available;
                available_window -= (available + padding) as i64;
                term_offset += available + padding;
                highest_pos += (available + padding) as i64;
            }

            if available == 0 || term_offset == term_length {
                break;
            }
        }

        if vlen > 0 {
            match self.endpoint.send_batch(&frames[..vlen]) {
                Ok(sent) if sent == vlen => {}
                Ok(_) => self.short_sends.increment(),
                Err(ref e) if is_transient(e) => self.short_sends.increment(),
                Err(e) => return Err(e.into()),
            }

            self.time_of_last_send_or_heartbeat.store(now.0, Ordering::Relaxed);
            self.track_sender_limits.store(true, Ordering::Relaxed);
            self.snd_pos.set_release(highest_pos);
        }

        if available_window <= 0 && self.track_sender_limits.load(Ordering::Relaxed) {
            self.sender_flow_control_limits.increment_release();
            self.track_sender_limits.store(false, Ordering::Relaxed);
        }

        Ok(bytes_sent)
    }

    /// Retransmit a NAKed range, one MTU-bounded datagram at a time. Ranges
    /// not yet sent or already aged out of the log are ignored.
    pub fn resend(&self, term_id: i32, term_offset: i32, length: usize) -> Result<(), DriverError> {
        let sender_position = self.snd_pos.get();
        let resend_position = compute_position(
            term_id,
            term_offset,
            self.position_bits_to_shift,
            self.initial_term_id,
        );
        let term_length = self.term_length();

        if resend_position < sender_position
            && resend_position >= sender_position - term_length as i64
        {
            let index = index_by_position(resend_position, self.position_bits_to_shift);
            let term = self.log.term(index);
            let mut offset = term_offset as usize;
            let mut remaining = length;

            while remaining > 0 && offset < term_length {
                let scan_limit = self.mtu_length.min(remaining);
                let (available, padding) = scan_for_availability(&term[offset..], scan_limit);
                if available == 0 {
                    break;
                }

                match self.endpoint.send(&term[offset..offset + available]) {
                    Ok(sent) if sent == available => {}
                    Ok(_) => {
                        self.short_sends.increment();
                        break;
                    }
                    Err(ref e) if is_transient(e) => {
                        self.short_sends.increment();
                        break;
                    }
                    Err(e) => return Err(e.into()),
                }

                remaining = remaining.saturating_sub(available + padding);
                offset += available + padding;
            }

            self.retransmits_sent.increment_release();
        }
        Ok(())
    }

    /// Conductor intake of a status message from `sender`.
    pub fn on_status_message(&self, sm: &StatusMessage, sender: SocketAddr) {
        self.log
            .metadata()
            .time_of_last_status_message
            .store(self.clocks.epoch_ms(), Ordering::Release);

        if !self.is_connected.load(Ordering::Acquire) {
            debug!(
                session_id = self.session_id,
                stream_id = self.stream_id,
                %sender,
                "publication connected"
            );
            self.is_connected.store(true, Ordering::Release);
        }

        let flow_control_position = self.flow_control.lock().unwrap().on_status_message(
            sm,
            sender,
            self.snd_lmt.get_volatile(),
            self.initial_term_id,
            self.position_bits_to_shift,
            self.clocks.nano_time(),
        );
        self.snd_lmt.set_release(flow_control_position);
    }

    /// Conductor intake of a NAK; the resend itself happens on the next
    /// sender tick.
    pub fn on_nak(&self, term_id: i32, term_offset: i32, length: i32) {
        let now = self.clocks.nano_time();
        self.retransmit.lock().unwrap().on_nak(
            term_id,
            term_offset,
            length,
            self.term_length(),
            now,
        );
    }

    /// Echo an RTTM probe that asks for a reply; anything else is ignored.
    pub fn on_rttm(&self, rttm: &RttmHeader) -> Result<(), DriverError> {
        if rttm.is_reply_requested() {
            let mut buf = [0u8; RTTM_HEADER_LENGTH];
            RttmHeader {
                frame_header: FrameHeader::new(RTTM_HEADER_LENGTH as i32, 0, HDR_TYPE_RTTM),
                session_id: self.session_id,
                stream_id: self.stream_id,
                echo_timestamp: rttm.echo_timestamp,
                reception_delta: 0,
                receiver_id: rttm.receiver_id,
            }
            .encode(&mut buf);
            self.send_control_frame(&buf)?;
        }
        Ok(())
    }

    /// Advance the producer limit to `min consumer + window` and clean aged
    /// terms behind it. Returns the work count for the conductor's duty
    /// cycle.
    pub fn update_pub_lmt(&self) -> usize {
        let snd_pos = self.snd_pos.get_volatile();

        if self.is_connected.load(Ordering::Acquire) {
            let mut state = self.conductor.lock().unwrap();

            let mut min_consumer_position = snd_pos;
            for spy in &state.spy_positions {
                if let Some(position) = spy.get_volatile() {
                    min_consumer_position = min_consumer_position.min(position);
                }
            }

            let proposed_pub_lmt = min_consumer_position + self.term_window_length;
            if self.pub_lmt.propose_max_release(proposed_pub_lmt) {
                self.clean_buffer(&mut state, proposed_pub_lmt);
                return 1;
            }
        } else if self.pub_lmt.get() > snd_pos {
            self.pub_lmt.set_release(snd_pos);
        }

        0
    }

    /// Zero aging terms, always keeping two terms of runway dirty for the
    /// producers.
    fn clean_buffer(&self, state: &mut ConductorState, pub_lmt: i64) {
        let clean_position = state.clean_position;
        let dirty_range = pub_lmt - clean_position;
        let buffer_capacity = self.term_length() as i64;
        let reserved_range = buffer_capacity * 2;

        if dirty_range > reserved_range {
            let dirty_index = index_by_position(clean_position, self.position_bits_to_shift);
            let term_offset = (clean_position & i64::from(self.term_length_mask)) as usize;
            let bytes_left_in_term = buffer_capacity as usize - term_offset;
            let length = ((dirty_range - reserved_range) as usize).min(bytes_left_in_term);

            unsafe {
                std::ptr::write_bytes(self.log.term_ptr(dirty_index).add(term_offset), 0, length);
            }
            state.clean_position = clean_position + length as i64;
        }
    }

    /// Conductor timer tick: connection timeout while active, then the
    /// draining / linger / closing walk.
    pub fn on_time_event(&self, now_ns: Nanos, now_ms: i64, conductor: &mut dyn DriverConductor) {
        let mut state = self.conductor.lock().unwrap();

        match state.status {
            PublicationStatus::Active => {
                if self.is_connected.load(Ordering::Acquire) {
                    let time_of_last_status_message =
                        self.log.metadata().time_of_last_status_message.load(Ordering::Acquire);
                    if now_ms > time_of_last_status_message + self.connection_timeout_ms {
                        debug!(
                            session_id = self.session_id,
                            stream_id = self.stream_id,
                            "no status messages, publication disconnected"
                        );
                        self.is_connected.store(false, Ordering::Release);
                    }
                }
            }

            PublicationStatus::Draining => {
                let snd_pos = self.snd_pos.get_volatile();
                if snd_pos == state.last_snd_pos {
                    if Self::spies_not_behind_sender(
                        &mut state,
                        conductor,
                        self.registration_id,
                        snd_pos,
                    ) {
                        self.is_complete.store(true, Ordering::Release);
                        state.time_of_last_activity = now_ns;
                        state.status = PublicationStatus::Linger;
                    }
                } else {
                    state.last_snd_pos = snd_pos;
                    state.time_of_last_activity = now_ns;
                }
            }

            PublicationStatus::Linger => {
                if now_ns > state.time_of_last_activity + self.linger_timeout {
                    state.status = PublicationStatus::Closing;
                    conductor.retire_publication(self.registration_id);
                }
            }

            PublicationStatus::Closing => {}
        }
    }

    fn spies_not_behind_sender(
        state: &mut ConductorState,
        conductor: &mut dyn DriverConductor,
        registration_id: i64,
        snd_pos: i64,
    ) -> bool {
        if !state.spy_positions.is_empty() {
            if state
                .spy_positions
                .iter()
                .any(|spy| spy.get_volatile().is_some_and(|position| position < snd_pos))
            {
                return false;
            }

            conductor.cleanup_spies(registration_id);
            for spy in state.spy_positions.drain(..) {
                conductor.counters_mut().free(spy.id());
            }
        }
        true
    }

    pub fn incref(&self) {
        self.conductor.lock().unwrap().refcnt += 1;
    }

    /// Dropping the last publisher handle starts the drain.
    pub fn decref(&self) {
        let mut state = self.conductor.lock().unwrap();
        state.refcnt -= 1;

        if state.refcnt == 0 {
            state.status = PublicationStatus::Draining;
            state.time_of_last_status_change = self.clocks.nano_time();
            debug!(registration_id = self.registration_id, "publication draining");
        }
    }

    /// Attach a same-host spy reader whose position gates cleaning and
    /// draining.
    pub fn add_spy_position(&self, spy: ReadablePosition) {
        self.conductor.lock().unwrap().spy_positions.push(spy);
    }

    pub fn producer_position(&self) -> i64 {
        self.log.producer_position(self.position_bits_to_shift, self.initial_term_id)
    }

    pub fn spy_join_position(&self) -> i64 {
        self.producer_position()
    }

    /// Ask the sender to start advertising setup frames again (new receiver
    /// on a multicast channel).
    pub fn trigger_send_setup_frame(&self) {
        self.should_send_setup_frame.store(true, Ordering::Release);
    }

    pub fn sender_release(&self) {
        self.has_sender_released.store(true, Ordering::Release);
    }

    pub fn has_sender_released(&self) -> bool {
        self.has_sender_released.load(Ordering::Acquire)
    }

    /// Release counter ids ahead of destruction; mapped resources go with
    /// the value itself.
    pub fn close(&self, counters: &mut CountersManager) {
        let mut state = self.conductor.lock().unwrap();
        counters.free(self.pub_lmt.id());
        counters.free(self.snd_pos.id());
        counters.free(self.snd_lmt.id());
        for spy in state.spy_positions.drain(..) {
            counters.free(spy.id());
        }
    }

    fn send_control_frame(&self, frame: &[u8]) -> Result<(), DriverError> {
        match self.endpoint.send(frame) {
            Ok(sent) if sent == frame.len() => Ok(()),
            Ok(_) => {
                self.short_sends.increment();
                Ok(())
            }
            Err(ref e) if is_transient(e) => {
                self.short_sends.increment();
                Ok(())
            }
            Err(e) => {
                warn!(
                    session_id = self.session_id,
                    stream_id = self.stream_id,
                    ?e,
                    "control frame send failed"
                );
                Err(e.into())
            }
        }
    }
}

#[inline]
fn is_transient(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted)
}
