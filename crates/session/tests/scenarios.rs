use frame::{Address, Error, Options, Params};
use session::SessionManager;
use std::sync::Arc;
use std::thread;

fn config(port: u16) -> Params {
    let mut p = Params::new();
    p.insert("ip".into(), "127.0.0.1".into());
    p.insert("port".into(), port.to_string());
    p
}

fn config_with_chaos(port: u16, chaos: u32) -> Params {
    let mut p = config(port);
    p.insert("chaos".into(), chaos.to_string());
    p
}

/// S3: handshake followed by a single one-frame payload.
#[test]
fn handshake_then_one_shot_payload() {
    let acceptor_mgr = Arc::new(SessionManager::new(Options::default()));
    let connector_mgr = Arc::new(SessionManager::new(Options::default()));

    let acceptor_addr = Address::from_params(&config(26280)).unwrap();
    let connector_addr = Address::from_params(&config(26281)).unwrap();

    let acceptor_thread = {
        let mgr = acceptor_mgr.clone();
        thread::spawn(move || {
            let session = mgr.accept(&config(26280), connector_addr, 5000).unwrap();
            let mut buf = vec![0u8; 64];
            let n = session.read(&mut buf, 5000).unwrap();
            buf.truncate(n);
            buf
        })
    };

    // give the acceptor's schedule_read a head start so its pending slot exists first.
    thread::sleep(std::time::Duration::from_millis(50));

    let connector = connector_mgr
        .connect(&config(26281), acceptor_addr, 5000)
        .unwrap();
    connector.write(b"hello world\0", 5000).unwrap();

    let received = acceptor_thread.join().unwrap();
    assert_eq!(received, b"hello world\0");
}

/// S4: accepting from the wildcard address learns the actual peer.
#[test]
fn accept_any_learns_the_peer() {
    let acceptor_mgr = Arc::new(SessionManager::new(Options::default()));
    let connector_mgr = Arc::new(SessionManager::new(Options::default()));

    let acceptor_addr = Address::from_params(&config(26290)).unwrap();
    let connector_addr = Address::from_params(&config(26291)).unwrap();

    let acceptor_thread = {
        let mgr = acceptor_mgr.clone();
        thread::spawn(move || {
            let session = mgr.accept(&config(26290), Address::WILDCARD, 5000).unwrap();
            session.config().1
        })
    };

    thread::sleep(std::time::Duration::from_millis(50));
    connector_mgr
        .connect(&config(26291), acceptor_addr, 5000)
        .unwrap();

    let learned = acceptor_thread.join().unwrap();
    assert_eq!(learned, connector_addr);
}

/// S5: a clean bulk transfer with no induced loss.
#[test]
fn bulk_transfer_without_chaos() {
    const TOTAL: usize = 1_262_140;
    run_bulk_transfer(26300, 26301, 0, 0, TOTAL);
}

/// S6: bulk transfer with fault injection on both sides, recovered via
/// selective retransmit.
#[test]
fn bulk_transfer_with_induced_corruption() {
    const TOTAL: usize = 4_096_000;
    run_bulk_transfer(26310, 26311, 124, 50, TOTAL);
}

fn run_bulk_transfer(acceptor_port: u16, connector_port: u16, acceptor_chaos: u32, connector_chaos: u32, total: usize) {
    let acceptor_mgr = Arc::new(SessionManager::new(Options::default()));
    let connector_mgr = Arc::new(SessionManager::new(Options::default()));

    let acceptor_cfg = config_with_chaos(acceptor_port, acceptor_chaos);
    let connector_cfg = config_with_chaos(connector_port, connector_chaos);
    let acceptor_addr = Address::from_params(&acceptor_cfg).unwrap();
    let connector_addr = Address::from_params(&connector_cfg).unwrap();

    let payload: Vec<u8> = (0..total).map(|i| (i % 251) as u8).collect();

    let acceptor_thread = {
        let mgr = acceptor_mgr.clone();
        let acceptor_cfg = acceptor_cfg.clone();
        thread::spawn(move || {
            let session = mgr.accept(&acceptor_cfg, connector_addr, 60_000).unwrap();
            let mut buf = vec![0u8; total];
            let mut got = 0usize;
            while got < total {
                got += session.read(&mut buf[got..], 60_000).unwrap();
            }
            buf
        })
    };

    thread::sleep(std::time::Duration::from_millis(50));
    let connector = connector_mgr
        .connect(&connector_cfg, acceptor_addr, 60_000)
        .unwrap();
    connector.write(&payload, 60_000).unwrap();

    let received = acceptor_thread.join().unwrap();
    assert_eq!(received, payload);
}

/// S8: a large session write whose receiver first supplies too small a
/// buffer, then retries with one large enough.
#[test]
fn session_large_transfer_reports_required_size() {
    const TOTAL: usize = 5 * 1024 * 1024;

    let acceptor_mgr = Arc::new(SessionManager::new(Options::default()));
    let connector_mgr = Arc::new(SessionManager::new(Options::default()));

    let acceptor_addr = Address::from_params(&config(26320)).unwrap();
    let connector_addr = Address::from_params(&config(26321)).unwrap();

    let payload: Vec<u8> = (0..TOTAL).map(|i| (i % 241) as u8).collect();

    let acceptor_thread = {
        let mgr = acceptor_mgr.clone();
        thread::spawn(move || {
            let session = mgr.accept(&config(26320), connector_addr, 60_000).unwrap();

            let mut undersized = vec![0u8; TOTAL / 2];
            let err = session.read(&mut undersized, 60_000).unwrap_err();
            let required = match err {
                Error::BufferOverflow { required_size } => required_size,
                other => panic!("expected BufferOverflow, got {other:?}"),
            };
            assert_eq!(required, TOTAL);

            let mut resized = vec![0u8; required];
            let n = session.read(&mut resized, 60_000).unwrap();
            resized.truncate(n);
            resized
        })
    };

    thread::sleep(std::time::Duration::from_millis(50));
    let connector = connector_mgr
        .connect(&config(26321), acceptor_addr, 60_000)
        .unwrap();
    connector.write(&payload, 60_000).unwrap();

    let received = acceptor_thread.join().unwrap();
    assert_eq!(received, payload);
}
