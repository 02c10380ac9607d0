static LISTEN_TIMEOUT: std::time::Duration = std::time::Duration::from_millis(5000);

fn main() {
    tracing_subscriber::fmt::init();

    let peer_addr: std::net::SocketAddr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:9998".into())
        .parse()
        .expect("invalid peer address");

    let backend =
        wxp::UdpBackend::bind(("127.0.0.1", 9999)).expect("failed to bind wxp server socket");
    let local_addr = backend.address();

    let context =
        wxp::Context::init(peer_addr.into(), backend).expect("failed to create wxp context");

    loop {
        let session = match context.listen_timeout(&local_addr, LISTEN_TIMEOUT) {
            Ok(session) => session,
            Err(wxp::Error::ListenTimeout) => continue,
            Err(err) => {
                println!("listen failed: {err}");
                return;
            }
        };

        println!("accepted {session:?}");

        let mut buf = [0; 2048];

        loop {
            match session.read(&mut buf) {
                Ok(len) => {
                    println!("received {:02X?}", &buf[..len]);

                    if let Err(err) = session.write(&buf[..len]) {
                        println!("write failed: {err}");
                        break;
                    }
                }
                Err(err) => {
                    println!("read ended: {err}");
                    break;
                }
            }
        }

        session.close().expect("failed to close session");

        println!("closed");
    }
}
