//! End-to-end handshake scenarios (§8), playing the server side over a
//! real loopback socket. These are integration tests rather than the
//! crate's `#[cfg(test)]` unit suites, since they need a listening socket
//! and a driver loop pumping the session's reactor.

use std::cell::RefCell;
use std::io::{Read, Write};
use std::net::TcpListener;
use std::rc::Rc;
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian};
use redq::channel::ChannelKind;
use redq::config::SessionConfig;
use redq::events::ChannelEvent;
use redq::message::{DataHeader, MSGC_ACK};
use redq::parser::{MainInit, MSG_MAIN_ATTACH_CHANNELS, MSG_MAIN_INIT};
use redq::session::Session;

/// Builds a well-formed server→client link message body (error=OK,
/// empty capability arrays) wrapping `pub_key_der`.
fn server_link_message_ok(pub_key_der: &[u8]) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&0u32.to_le_bytes()); // error = OK
    body.extend_from_slice(pub_key_der);
    body.extend_from_slice(&0u16.to_le_bytes()); // reserved
    body.extend_from_slice(&0u32.to_le_bytes()); // num_common
    body.extend_from_slice(&0u32.to_le_bytes()); // num_channel
    body.extend_from_slice(&0u32.to_le_bytes()); // caps_offset
    body
}

fn server_link_header(major: u32, minor: u32, size: u32) -> Vec<u8> {
    let mut buf = vec![0u8; 16];
    LittleEndian::write_u32(&mut buf[0..4], 0x5144_4552);
    LittleEndian::write_u32(&mut buf[4..8], major);
    LittleEndian::write_u32(&mut buf[8..12], minor);
    LittleEndian::write_u32(&mut buf[12..16], size);
    buf
}

fn read_exact_vec(stream: &mut impl Read, n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    stream.read_exact(&mut buf).unwrap();
    buf
}

/// Writes one steady-state frame: a `DataHeader` followed by `body`.
fn write_top_level(stream: &mut impl Write, serial: u64, msg_type: u16, body: &[u8], sub_list: u32) {
    let header = DataHeader { serial, msg_type, size: body.len() as u32, sub_list };
    let mut buf = vec![0u8; DataHeader::LENGTH];
    header.serialize_into(&mut buf).unwrap();
    stream.write_all(&buf).unwrap();
    stream.write_all(body).unwrap();
}

fn test_rsa_key() -> (rsa::RsaPrivateKey, Vec<u8>) {
    use rand::rngs::OsRng;
    use rsa::pkcs8::EncodePublicKey;
    let priv_key = rsa::RsaPrivateKey::new(&mut OsRng, 1024).unwrap();
    let pub_key = rsa::RsaPublicKey::from(&priv_key);
    let der = pub_key.to_public_key_der().unwrap().as_bytes().to_vec();
    (priv_key, der)
}

/// A self-signed loopback certificate good enough for `rustls` to validate
/// against the IP literal the tests connect to.
fn self_signed_loopback_cert() -> rcgen::Certificate {
    use rcgen::{CertificateParams, SanType};
    let mut params = CertificateParams::default();
    params.subject_alt_names = vec![SanType::IpAddress(std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST))];
    rcgen::Certificate::from_params(params).unwrap()
}

fn write_ca_pem(cert: &rcgen::Certificate, tag: u16) -> std::path::PathBuf {
    let path = std::env::temp_dir().join(format!("redq-test-ca-{}.pem", tag));
    std::fs::write(&path, cert.serialize_pem().unwrap()).unwrap();
    path
}

fn pump_until<F: Fn() -> bool>(session: &Rc<RefCell<Session>>, done: F, max_iters: usize) {
    for _ in 0..max_iters {
        if done() {
            return;
        }
        Session::run_once(session, Some(Duration::from_millis(50))).unwrap();
    }
}

#[test]
fn s1_happy_path_plain() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let (priv_key, pub_der) = test_rsa_key();

    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let _link_hdr = read_exact_vec(&mut stream, 16);
        let link_msg_len = LittleEndian::read_u32(&_link_hdr[12..16]) as usize;
        let _link_msg = read_exact_vec(&mut stream, link_msg_len);

        let body = server_link_message_ok(&pub_der);
        stream.write_all(&server_link_header(2, 0, body.len() as u32)).unwrap();
        stream.write_all(&body).unwrap();

        use rsa::Oaep;
        let modulus_size = rsa::traits::PublicKeyParts::size(&rsa::RsaPublicKey::from(&priv_key));
        let ciphertext = read_exact_vec(&mut stream, modulus_size);
        let padding = Oaep::new::<sha1::Sha1>();
        let plaintext = priv_key.decrypt(padding, &ciphertext).unwrap();
        assert_eq!(&plaintext[..3], b"abc");

        stream.write_all(&0u32.to_le_bytes()).unwrap();
        thread::sleep(Duration::from_millis(200));
    });

    let session = Session::new(
        SessionConfig::new("127.0.0.1", addr.port()).password("abc"),
    )
    .unwrap();

    let (tx, rx) = mpsc::channel();
    session.borrow_mut().set_event_handler(move |kind, id, event| {
        tx.send((kind, id, event)).unwrap();
    });

    let channel = Session::channel_new(&session, ChannelKind::Main, 0);
    channel.borrow_mut().connect(false).unwrap();

    pump_until(&session, || matches!(rx.try_recv(), Ok(_)), 40);

    server.join().unwrap();
}

#[test]
fn s2_need_secured_upgrades_to_tls() {
    let plain_listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let plain_addr = plain_listener.local_addr().unwrap();
    let tls_listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let tls_addr = tls_listener.local_addr().unwrap();
    let (priv_key, pub_der) = test_rsa_key();

    let cert = self_signed_loopback_cert();
    let cert_der = cert.serialize_der().unwrap();
    let key_der = cert.serialize_private_key_der();
    let ca_path = write_ca_pem(&cert, tls_addr.port());

    let server = thread::spawn(move || {
        // First attempt, plain: the server demands TLS (§4.5 / §8 S2).
        let (mut stream, _) = plain_listener.accept().unwrap();
        let hdr = read_exact_vec(&mut stream, 16);
        let link_msg_len = LittleEndian::read_u32(&hdr[12..16]) as usize;
        let _ = read_exact_vec(&mut stream, link_msg_len);

        let need_secured = 1u32.to_le_bytes().to_vec(); // link_error::NEED_SECURED
        stream.write_all(&server_link_header(2, 0, need_secured.len() as u32)).unwrap();
        stream.write_all(&need_secured).unwrap();
        drop(stream);

        // Second attempt, over TLS: a normal handshake, just encrypted.
        let (mut std_stream, _) = tls_listener.accept().unwrap();
        let server_config = rustls::ServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_single_cert(vec![rustls::Certificate(cert_der)], rustls::PrivateKey(key_der))
            .unwrap();
        let mut conn = rustls::ServerConnection::new(Arc::new(server_config)).unwrap();
        let mut tls = rustls::Stream::new(&mut conn, &mut std_stream);

        let hdr = read_exact_vec(&mut tls, 16);
        let link_msg_len = LittleEndian::read_u32(&hdr[12..16]) as usize;
        let _ = read_exact_vec(&mut tls, link_msg_len);

        let body = server_link_message_ok(&pub_der);
        tls.write_all(&server_link_header(2, 0, body.len() as u32)).unwrap();
        tls.write_all(&body).unwrap();

        use rsa::Oaep;
        let modulus_size = rsa::traits::PublicKeyParts::size(&rsa::RsaPublicKey::from(&priv_key));
        let ciphertext = read_exact_vec(&mut tls, modulus_size);
        let padding = Oaep::new::<sha1::Sha1>();
        let _ = priv_key.decrypt(padding, &ciphertext).unwrap();
        tls.write_all(&0u32.to_le_bytes()).unwrap();
        thread::sleep(Duration::from_millis(200));
    });

    let session = Session::new(
        SessionConfig::new("127.0.0.1", plain_addr.port())
            .tls_port(tls_addr.port())
            .ca_file(ca_path)
            .password("abc"),
    )
    .unwrap();

    let (tx, rx) = mpsc::channel();
    session.borrow_mut().set_event_handler(move |kind, id, event| {
        tx.send((kind, id, event)).unwrap();
    });

    let channel = Session::channel_new(&session, ChannelKind::Main, 0);
    channel.borrow_mut().connect(false).unwrap();

    pump_until(&session, || matches!(rx.try_recv(), Ok((_, _, ChannelEvent::Opened))), 80);
    assert_eq!(channel.borrow().state(), redq::channel::State::Ready);

    server.join().unwrap();
}

#[test]
fn s3_protocol_downgrade_to_major_1() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let (priv_key, pub_der) = test_rsa_key();

    let server = thread::spawn(move || {
        // First connection: advertise major=1, prompting a silent
        // client-side reconnect with protocol downgraded (§8 S3).
        let (mut stream, _) = listener.accept().unwrap();
        let hdr = read_exact_vec(&mut stream, 16);
        let link_msg_len = LittleEndian::read_u32(&hdr[12..16]) as usize;
        let _ = read_exact_vec(&mut stream, link_msg_len);
        stream.write_all(&server_link_header(1, 0, 0)).unwrap();
        drop(stream);

        // Second connection: client now sends major=1.
        let (mut stream, _) = listener.accept().unwrap();
        let hdr = read_exact_vec(&mut stream, 16);
        assert_eq!(LittleEndian::read_u32(&hdr[4..8]), 1, "client did not downgrade to major 1");
        let link_msg_len = LittleEndian::read_u32(&hdr[12..16]) as usize;
        let _ = read_exact_vec(&mut stream, link_msg_len);

        let body = server_link_message_ok(&pub_der);
        stream.write_all(&server_link_header(1, 0, body.len() as u32)).unwrap();
        stream.write_all(&body).unwrap();

        use rsa::Oaep;
        let modulus_size = rsa::traits::PublicKeyParts::size(&rsa::RsaPublicKey::from(&priv_key));
        let ciphertext = read_exact_vec(&mut stream, modulus_size);
        let padding = Oaep::new::<sha1::Sha1>();
        let _ = priv_key.decrypt(padding, &ciphertext).unwrap();
        stream.write_all(&0u32.to_le_bytes()).unwrap();
        thread::sleep(Duration::from_millis(200));
    });

    let session = Session::new(SessionConfig::new("127.0.0.1", addr.port()).password("xyz")).unwrap();
    let (tx, rx) = mpsc::channel();
    session.borrow_mut().set_event_handler(move |kind, id, event| {
        tx.send((kind, id, event)).unwrap();
    });

    let channel = Session::channel_new(&session, ChannelKind::Main, 0);
    channel.borrow_mut().connect(false).unwrap();

    pump_until(&session, || matches!(rx.try_recv(), Ok((_, _, ChannelEvent::Opened))), 60);

    server.join().unwrap();
}

#[test]
fn s4_ack_emitted_after_window_messages() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let (priv_key, pub_der) = test_rsa_key();

    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let hdr = read_exact_vec(&mut stream, 16);
        let link_msg_len = LittleEndian::read_u32(&hdr[12..16]) as usize;
        let _ = read_exact_vec(&mut stream, link_msg_len);

        let body = server_link_message_ok(&pub_der);
        stream.write_all(&server_link_header(2, 0, body.len() as u32)).unwrap();
        stream.write_all(&body).unwrap();

        use rsa::Oaep;
        let modulus_size = rsa::traits::PublicKeyParts::size(&rsa::RsaPublicKey::from(&priv_key));
        let ciphertext = read_exact_vec(&mut stream, modulus_size);
        let padding = Oaep::new::<sha1::Sha1>();
        let _ = priv_key.decrypt(padding, &ciphertext).unwrap();
        stream.write_all(&0u32.to_le_bytes()).unwrap();

        let attach_hdr = read_exact_vec(&mut stream, DataHeader::LENGTH);
        let attach = DataHeader::deserialize_from(&attach_hdr).unwrap();
        assert_eq!(attach.msg_type, MSG_MAIN_ATTACH_CHANNELS);
        assert_eq!(attach.size, 0);

        // Announce a 3-message ACK window, then send exactly that many
        // plain messages; the client's next write must be a single ACK.
        let mut init_body = [0u8; MainInit::WIRE_LEN];
        MainInit { connection_id: 1, ack_window: 3 }.serialize_into(&mut init_body);
        write_top_level(&mut stream, 1, MSG_MAIN_INIT, &init_body, 0);

        for serial in 2..5u64 {
            write_top_level(&mut stream, serial, 999, &[], 0);
        }

        let ack_hdr = read_exact_vec(&mut stream, DataHeader::LENGTH);
        let ack = DataHeader::deserialize_from(&ack_hdr).unwrap();
        assert_eq!(ack.msg_type, MSGC_ACK);
        assert_eq!(ack.size, 0);
    });

    let session = Session::new(SessionConfig::new("127.0.0.1", addr.port()).password("abc")).unwrap();
    let channel = Session::channel_new(&session, ChannelKind::Main, 0);
    channel.borrow_mut().connect(false).unwrap();

    pump_until(&session, || server.is_finished(), 200);
    server.join().unwrap();
}

#[test]
fn s5_sub_messages_dispatch_before_parent() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let (priv_key, pub_der) = test_rsa_key();

    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let hdr = read_exact_vec(&mut stream, 16);
        let link_msg_len = LittleEndian::read_u32(&hdr[12..16]) as usize;
        let _ = read_exact_vec(&mut stream, link_msg_len);

        let body = server_link_message_ok(&pub_der);
        stream.write_all(&server_link_header(2, 0, body.len() as u32)).unwrap();
        stream.write_all(&body).unwrap();

        use rsa::Oaep;
        let modulus_size = rsa::traits::PublicKeyParts::size(&rsa::RsaPublicKey::from(&priv_key));
        let ciphertext = read_exact_vec(&mut stream, modulus_size);
        let padding = Oaep::new::<sha1::Sha1>();
        let _ = priv_key.decrypt(padding, &ciphertext).unwrap();
        stream.write_all(&0u32.to_le_bytes()).unwrap();

        let attach_hdr = read_exact_vec(&mut stream, DataHeader::LENGTH);
        let attach = DataHeader::deserialize_from(&attach_hdr).unwrap();
        assert_eq!(attach.msg_type, MSG_MAIN_ATTACH_CHANNELS);

        // A parent MSG_MAIN_INIT(connection_id=9) carrying one sub-message
        // that is itself MSG_MAIN_INIT(connection_id=5). Sub-messages
        // dispatch before their parent (§4.5 step 4), so the sticky
        // connection id should end up 5, not 9.
        let mut parent_body = [0u8; MainInit::WIRE_LEN];
        MainInit { connection_id: 9, ack_window: 20 }.serialize_into(&mut parent_body);

        let mut sub_body = [0u8; MainInit::WIRE_LEN];
        MainInit { connection_id: 5, ack_window: 7 }.serialize_into(&mut sub_body);

        let mut payload = parent_body.to_vec();
        let sub_list_offset = payload.len() as u32;
        payload.extend_from_slice(&1u16.to_le_bytes()); // one sub-message
        let offsets_pos = payload.len();
        payload.extend_from_slice(&0u32.to_le_bytes()); // patched below
        let sub_offset = payload.len() as u32;
        payload.extend_from_slice(&MSG_MAIN_INIT.to_le_bytes());
        payload.extend_from_slice(&(sub_body.len() as u32).to_le_bytes());
        payload.extend_from_slice(&sub_body);
        LittleEndian::write_u32(&mut payload[offsets_pos..offsets_pos + 4], sub_offset);

        write_top_level(&mut stream, 1, MSG_MAIN_INIT, &payload, sub_list_offset);
        thread::sleep(Duration::from_millis(200));
    });

    let session = Session::new(SessionConfig::new("127.0.0.1", addr.port()).password("abc")).unwrap();
    let channel = Session::channel_new(&session, ChannelKind::Main, 0);
    channel.borrow_mut().connect(false).unwrap();

    pump_until(&session, || session.borrow().get_connection_id() != 0, 80);
    assert_eq!(session.borrow().get_connection_id(), 5, "sub-message should dispatch before its parent");

    server.join().unwrap();
}

#[test]
fn s6_mid_header_disconnect_emits_closed() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut partial = [0u8; 16];
        let n = stream.read(&mut partial).unwrap();
        assert!(n > 0);
        // Close after a partial link header, per §8 S6.
        drop(stream);
    });

    let session = Session::new(SessionConfig::new("127.0.0.1", addr.port())).unwrap();
    let (tx, rx) = mpsc::channel();
    session.borrow_mut().set_event_handler(move |kind, id, event| {
        tx.send((kind, id, event)).unwrap();
    });

    let channel = Session::channel_new(&session, ChannelKind::Main, 0);
    channel.borrow_mut().connect(false).unwrap();

    pump_until(&session, || matches!(rx.try_recv(), Ok((_, _, ChannelEvent::Closed))), 60);
    assert_eq!(channel.borrow().state(), redq::channel::State::Unconnected);

    server.join().unwrap();
}
