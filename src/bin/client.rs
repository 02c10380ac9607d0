use std::io::BufRead;

fn main() {
    tracing_subscriber::fmt::init();

    let server_addr: std::net::SocketAddr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:9999".into())
        .parse()
        .expect("invalid server address");

    let backend =
        wxp::UdpBackend::bind(("127.0.0.1", 9998)).expect("failed to bind wxp client socket");
    let local_addr = backend.address();

    let context =
        wxp::Context::init(server_addr.into(), backend).expect("failed to create wxp context");

    let session = context
        .connect(local_addr)
        .expect("failed to connect to wxp server");

    println!("connected {session:?}");

    let mut buf = [0; 2048];

    for line in std::io::stdin().lock().lines() {
        let line = line.expect("failed to read stdin");

        if line.is_empty() {
            continue;
        }

        if let Err(err) = session.write(line.as_bytes()) {
            println!("write failed: {err}");
            break;
        }

        match session.read(&mut buf) {
            Ok(len) => println!("echo: {}", String::from_utf8_lossy(&buf[..len])),
            Err(err) => {
                println!("read failed: {err}");
                break;
            }
        }
    }

    session.close().expect("failed to close session");
}
