//! Integration test for the async driver loop, using a scripted in-memory
//! transport instead of a real socket.

use async_trait::async_trait;
use serde_json::json;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use tether::driver;
use tether::session::{Session, SessionOptions};
use tether::socket::SocketOptions;
use tether::transport::{CloseEvent, Connector, Transport, TransportEvent};
use tether::Message;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

struct ScriptedTransport {
    events: VecDeque<TransportEvent>,
    sent: Rc<RefCell<Vec<String>>>,
}

#[async_trait(?Send)]
impl Transport for ScriptedTransport {
    async fn next(&mut self) -> Option<TransportEvent> {
        self.events.pop_front()
    }

    async fn send(&mut self, frame: String) -> Result<(), String> {
        self.sent.borrow_mut().push(frame);
        Ok(())
    }

    async fn close(&mut self, _code: u16, _reason: String) {}
}

/// Hands out one scripted connection per dial.
struct ScriptedConnector {
    scripts: VecDeque<Vec<TransportEvent>>,
    sent: Rc<RefCell<Vec<String>>>,
    dials: Rc<RefCell<u32>>,
}

#[async_trait(?Send)]
impl Connector for ScriptedConnector {
    type Conn = ScriptedTransport;

    async fn connect(&mut self, _url: &str) -> Result<Self::Conn, String> {
        *self.dials.borrow_mut() += 1;
        let events = self
            .scripts
            .pop_front()
            .ok_or_else(|| "no more scripted connections".to_string())?;
        Ok(ScriptedTransport {
            events: events.into(),
            sent: self.sent.clone(),
        })
    }
}

#[tokio::test]
async fn test_driver_runs_until_the_session_gives_up() {
    init_tracing();
    let sent = Rc::new(RefCell::new(Vec::new()));
    let dials = Rc::new(RefCell::new(0));
    let mut connector = ScriptedConnector {
        scripts: VecDeque::from(vec![vec![
            TransportEvent::Open,
            TransportEvent::Close(CloseEvent::abnormal("server went away")),
        ]]),
        sent: sent.clone(),
        dials: dials.clone(),
    };

    // A zero reconnect ceiling: the first abnormal close trips the guard and
    // the driver loop goes quiescent.
    let mut session = Session::new(
        "ws://localhost:4000/socket",
        SocketOptions::default(),
        SessionOptions {
            max_reconnect_rounds: 0,
            jitter_spread: 0.0,
            seed: Some(1),
            ..SessionOptions::default()
        },
    );
    let room = session.socket_mut().channel("room:1", json!({}));
    session.socket_mut().join(room).unwrap();
    session.connect();

    driver::run(&mut session, &mut connector).await;

    assert_eq!(*dials.borrow(), 1);
    assert_eq!(session.status(), tether::SessionStatus::GaveUp);

    // The join buffered before the dial went out once the connection opened.
    let frames = sent.borrow();
    assert_eq!(frames.len(), 1);
    let join = Message::decode(&frames[0]).unwrap();
    assert_eq!(join.topic, "room:1");
    assert_eq!(join.event, "phx_join");
    assert_eq!(join.join_ref, join.msg_ref);
}

#[tokio::test]
async fn test_driver_exits_after_a_clean_disconnect_script() {
    init_tracing();
    let sent = Rc::new(RefCell::new(Vec::new()));
    let dials = Rc::new(RefCell::new(0));
    let mut connector = ScriptedConnector {
        scripts: VecDeque::from(vec![vec![
            TransportEvent::Open,
            TransportEvent::Close(CloseEvent::normal()),
        ]]),
        sent: sent.clone(),
        dials: dials.clone(),
    };

    let mut session = Session::new(
        "ws://localhost:4000/socket",
        SocketOptions::default(),
        SessionOptions::default(),
    );
    session.connect();

    driver::run(&mut session, &mut connector).await;

    // A normal closure schedules nothing, so the loop returns after one dial.
    assert_eq!(*dials.borrow(), 1);
    assert_eq!(session.status(), tether::SessionStatus::Disconnected);
    assert!(sent.borrow().is_empty());
}
