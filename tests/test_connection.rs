use std::cell::{Cell, RefCell};
use std::rc::Rc;

use portcullis::handler::PendingOperation;
use portcullis::http::connection::{ActiveRequests, Admission, Connection};
use portcullis::http::reply::Reply;
use portcullis::http::wake::WorkerWaker;
use portcullis::http::wire::{FrameKind, OutboundFrame, Wire};

/// Never completes. Keeps its slot occupied until cancelled.
struct IdleOp;

impl PendingOperation for IdleOp {
    fn start(&mut self, _reply: &mut Reply) -> anyhow::Result<()> {
        Ok(())
    }

    fn peek(&mut self, _reply: &mut Reply, _need_wait: bool) -> anyhow::Result<()> {
        Ok(())
    }

    fn cancel(&mut self) {}
}

/// Records when it is started and completes on the first peek after the
/// shared `done` flag is raised.
struct RecordingOp {
    id: u64,
    log: Rc<RefCell<Vec<u64>>>,
    done: Rc<Cell<bool>>,
}

impl PendingOperation for RecordingOp {
    fn start(&mut self, _reply: &mut Reply) -> anyhow::Result<()> {
        self.log.borrow_mut().push(self.id);
        Ok(())
    }

    fn peek(&mut self, reply: &mut Reply, _need_wait: bool) -> anyhow::Result<()> {
        if self.done.get() && !reply.is_finished() {
            reply.send_ok(b"done")?;
        }
        Ok(())
    }

    fn cancel(&mut self) {}
}

/// Opens a chunked stream during start and finishes it on the peek that
/// follows the first write completion.
struct StreamOp;

impl PendingOperation for StreamOp {
    fn start(&mut self, reply: &mut Reply) -> anyhow::Result<()> {
        reply.send(b"x", false)?;
        Ok(())
    }

    fn peek(&mut self, reply: &mut Reply, _need_wait: bool) -> anyhow::Result<()> {
        if !reply.is_finished() && reply.is_output_ready() {
            reply.send(b"rest", true)?;
        }
        Ok(())
    }

    fn cancel(&mut self) {}
}

fn reply(wire: &Rc<Wire>, id: u64) -> Reply {
    Reply::new(id, true, Rc::clone(wire), WorkerWaker::new())
}

fn drain(wire: &Rc<Wire>) -> Vec<OutboundFrame> {
    let mut frames = Vec::new();
    while let Some(frame) = wire.pop() {
        frames.push(frame);
    }
    frames
}

#[test]
fn test_connection_caps_are_never_exceeded() {
    let wire = Wire::new();
    let counter = ActiveRequests::new();
    let mut conn = Connection::new(2, 3, Rc::clone(&wire), counter.clone());

    let mut outcomes = Vec::new();
    for id in 1..=10 {
        outcomes.push(conn.postpone(reply(&wire, id), Box::new(IdleOp)).unwrap());
        assert!(conn.pending_len() <= 2);
        assert!(conn.backlog_len() <= 3);
    }

    assert_eq!(conn.pending_len(), 2);
    assert_eq!(conn.backlog_len(), 3);
    assert_eq!(counter.get(), 5);
    assert_eq!(outcomes.iter().filter(|o| **o == Admission::Rejected).count(), 5);
}

#[test]
fn test_connection_admission_scenario() {
    let wire = Wire::new();
    let counter = ActiveRequests::new();
    let mut conn = Connection::new(2, 1, Rc::clone(&wire), counter.clone());

    assert_eq!(conn.postpone(reply(&wire, 1), Box::new(IdleOp)).unwrap(), Admission::Admitted);
    assert_eq!(conn.postpone(reply(&wire, 2), Box::new(IdleOp)).unwrap(), Admission::Admitted);
    assert_eq!(conn.postpone(reply(&wire, 3), Box::new(IdleOp)).unwrap(), Admission::Backlogged);
    assert_eq!(conn.postpone(reply(&wire, 4), Box::new(IdleOp)).unwrap(), Admission::Rejected);

    assert_eq!(conn.pending_len(), 2);
    assert_eq!(conn.backlog_len(), 1);
    assert_eq!(counter.get(), 3);

    // The only bytes queued belong to the rejection notice.
    let frames = drain(&wire);
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].reply_id, 4);
    match &frames[0].kind {
        FrameKind::Data { bytes, .. } => {
            let text = String::from_utf8_lossy(bytes);
            assert!(text.starts_with("HTTP/1.1 503 Service Unavailable\r\n"));
            assert!(text.ends_with("Too many pending requests"));
        }
        FrameKind::Abort => panic!("expected a data frame"),
    }
}

#[test]
fn test_connection_backlog_promotes_in_arrival_order() {
    let wire = Wire::new();
    let counter = ActiveRequests::new();
    let mut conn = Connection::new(1, 8, Rc::clone(&wire), counter.clone());

    let log = Rc::new(RefCell::new(Vec::new()));
    let done = Rc::new(Cell::new(false));

    for id in 1..=5 {
        let op = RecordingOp { id, log: Rc::clone(&log), done: Rc::clone(&done) };
        conn.postpone(reply(&wire, id), Box::new(op)).unwrap();
    }
    assert_eq!(*log.borrow(), vec![1]);
    assert_eq!(conn.backlog_len(), 4);

    done.set(true);
    for _ in 0..5 {
        conn.peek_async(false);
    }

    assert_eq!(*log.borrow(), vec![1, 2, 3, 4, 5]);
    assert_eq!(conn.pending_len(), 0);
    assert_eq!(conn.backlog_len(), 0);
    assert_eq!(counter.get(), 0);
}

#[test]
fn test_connection_write_completion_resumes_stream() {
    let wire = Wire::new();
    let counter = ActiveRequests::new();
    let mut conn = Connection::new(1, 2, Rc::clone(&wire), counter.clone());

    assert_eq!(conn.postpone(reply(&wire, 1), Box::new(StreamOp)).unwrap(), Admission::Admitted);
    assert_eq!(conn.postpone(reply(&wire, 2), Box::new(StreamOp)).unwrap(), Admission::Backlogged);
    assert_eq!(counter.get(), 2);

    // First write of reply 1 hits the socket: the reply finishes its
    // stream and the freed slot starts reply 2.
    conn.on_write_done(1);
    assert_eq!(conn.pending_len(), 1);
    assert_eq!(conn.backlog_len(), 0);
    assert_eq!(counter.get(), 1);

    conn.on_write_done(2);
    assert_eq!(conn.pending_len(), 0);
    assert_eq!(counter.get(), 0);

    // Frames: 1's open + 1's tail, then 2's open + 2's tail.
    let order: Vec<u64> = drain(&wire).iter().map(|f| f.reply_id).collect();
    assert_eq!(order, vec![1, 1, 2, 2]);
}

#[test]
fn test_connection_close_cancels_everything_silently() {
    let wire = Wire::new();
    let counter = ActiveRequests::new();
    let mut conn = Connection::new(2, 4, Rc::clone(&wire), counter.clone());

    conn.postpone(reply(&wire, 1), Box::new(StreamOp)).unwrap();
    conn.postpone(reply(&wire, 2), Box::new(IdleOp)).unwrap();
    conn.postpone(reply(&wire, 3), Box::new(IdleOp)).unwrap();
    conn.postpone(reply(&wire, 4), Box::new(IdleOp)).unwrap();
    assert_eq!(counter.get(), 4);
    drain(&wire);

    conn.on_closed_connection();

    assert!(conn.is_closed());
    assert_eq!(conn.pending_len(), 0);
    assert_eq!(conn.backlog_len(), 0);
    assert_eq!(counter.get(), 0);
    // The socket is gone, so nobody gets a goodbye.
    assert!(drain(&wire).is_empty());
}

#[test]
fn test_connection_drain_notifies_waiting_requests() {
    let wire = Wire::new();
    let counter = ActiveRequests::new();
    let mut conn = Connection::new(2, 2, Rc::clone(&wire), counter.clone());

    // Reply 1 has a write in flight; reply 2 has not started output.
    conn.postpone(reply(&wire, 1), Box::new(StreamOp)).unwrap();
    conn.postpone(reply(&wire, 2), Box::new(IdleOp)).unwrap();
    drain(&wire);

    conn.on_before_closed_connection();

    // Reply 2 got its cancellation notice right away; reply 1 must wait
    // for the in-flight write before the stream can be torn down.
    assert_eq!(conn.pending_len(), 1);
    assert_eq!(counter.get(), 1);

    let frames = drain(&wire);
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].reply_id, 2);
    match &frames[0].kind {
        FrameKind::Data { bytes, .. } => {
            let text = String::from_utf8_lossy(bytes);
            assert!(text.starts_with("HTTP/1.1 503 Service Unavailable\r\n"));
            assert!(text.ends_with("Request has been cancelled"));
        }
        FrameKind::Abort => panic!("expected a data frame"),
    }

    conn.on_write_done(1);
    assert_eq!(conn.pending_len(), 0);
    assert_eq!(counter.get(), 0);
    let frames = drain(&wire);
    assert_eq!(frames.len(), 1);
    assert!(matches!(frames[0].kind, FrameKind::Abort));
}
