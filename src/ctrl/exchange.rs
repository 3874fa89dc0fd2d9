use std::io::{self, prelude::*};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::mpsc;
use std::time::Duration;

/// Out-of-band channel delivering one text record to the peer and one back.
pub trait Exchange {
    /// Send `local` to the peer and return what the peer sent.
    fn exchange(&mut self, local: &str) -> io::Result<String>;
}

fn stream_write(stream: &mut TcpStream, buf: &[u8]) -> io::Result<()> {
    let len = u32::try_from(buf.len()).map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "message too long"))?;
    stream.write_all(&len.to_le_bytes())?;
    stream.write_all(buf)?;
    stream.flush()
}

fn stream_read(stream: &mut TcpStream, max_len: usize) -> io::Result<Vec<u8>> {
    let mut len = [0; 4];
    stream.read_exact(&mut len)?;
    let len = u32::from_le_bytes(len) as usize;
    if len > max_len {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("message of {} bytes exceeds limit {}", len, max_len),
        ));
    }

    let mut buf = vec![0; len];
    stream.read_exact(&mut buf)?;
    Ok(buf)
}

/// Exchange over a TCP connection with length-prefixed frames.
///
/// The side that connected reads first; the side that accepted writes first.
#[derive(Debug)]
pub struct TcpExchange {
    stream: TcpStream,
    connector: bool,
}

impl TcpExchange {
    /// The default TCP port to use.
    pub const DEFAULT_PORT: u16 = 13337;

    /// Largest frame accepted from the peer.
    pub const MAX_FRAME: usize = 4096;

    /// Connect to a listening peer, retrying until it is up or `timeout`
    /// expires.
    pub fn connect(addr: impl ToSocketAddrs, timeout: Duration) -> io::Result<Self> {
        let addrs = addr.to_socket_addrs()?.collect::<Vec<SocketAddr>>();
        let deadline = quanta::Instant::now() + timeout;
        let wait_on_failure = Duration::from_millis(200);

        loop {
            let err = match TcpStream::connect(&addrs[..]) {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    log::debug!("connected to {:?}", stream.peer_addr());
                    return Ok(Self {
                        stream,
                        connector: true,
                    });
                }
                Err(e) => e,
            };
            if quanta::Instant::now() + wait_on_failure > deadline {
                return Err(err);
            }
            std::thread::sleep(wait_on_failure);
        }
    }

    /// Accept one peer on a bound listener.
    pub fn accept(listener: &TcpListener) -> io::Result<Self> {
        let (stream, peer) = listener.accept()?;
        stream.set_nodelay(true)?;
        log::debug!("accepted {}", peer);
        Ok(Self {
            stream,
            connector: false,
        })
    }

    /// Listen on `addr` and accept one peer.
    pub fn listen(addr: impl ToSocketAddrs) -> io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        Self::accept(&listener)
    }

    fn read_string(&mut self) -> io::Result<String> {
        let buf = stream_read(&mut self.stream, Self::MAX_FRAME)?;
        String::from_utf8(buf).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

impl Exchange for TcpExchange {
    fn exchange(&mut self, local: &str) -> io::Result<String> {
        if self.connector {
            let peer = self.read_string()?;
            stream_write(&mut self.stream, local.as_bytes())?;
            Ok(peer)
        } else {
            stream_write(&mut self.stream, local.as_bytes())?;
            self.read_string()
        }
    }
}

/// In-process exchange between two threads.
#[derive(Debug)]
pub struct ChannelExchange {
    tx: mpsc::Sender<String>,
    rx: mpsc::Receiver<String>,
}

impl ChannelExchange {
    /// Create two connected ends.
    pub fn pair() -> (Self, Self) {
        let (tx_a, rx_b) = mpsc::channel();
        let (tx_b, rx_a) = mpsc::channel();
        (Self { tx: tx_a, rx: rx_a }, Self { tx: tx_b, rx: rx_b })
    }
}

impl Exchange for ChannelExchange {
    fn exchange(&mut self, local: &str) -> io::Result<String> {
        self.tx
            .send(local.to_owned())
            .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))?;
        self.rx
            .recv()
            .map_err(|_| io::Error::from(io::ErrorKind::UnexpectedEof))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_pair_swaps_records() {
        let (mut a, mut b) = ChannelExchange::pair();
        let t = std::thread::spawn(move || b.exchange("from b").unwrap());
        assert_eq!(a.exchange("from a").unwrap(), "from b");
        assert_eq!(t.join().unwrap(), "from a");
    }

    #[test]
    fn channel_reports_hangup() {
        let (mut a, b) = ChannelExchange::pair();
        drop(b);
        assert!(a.exchange("hello").is_err());
    }

    #[test]
    fn tcp_swaps_records() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = std::thread::spawn(move || {
            let mut ex = TcpExchange::accept(&listener).unwrap();
            ex.exchange("server").unwrap()
        });

        let mut ex = TcpExchange::connect(addr, Duration::from_secs(5)).unwrap();
        assert_eq!(ex.exchange("client").unwrap(), "server");
        assert_eq!(server.join().unwrap(), "client");
    }

    #[test]
    fn tcp_rejects_oversized_frames() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            stream.write_all(&u32::MAX.to_le_bytes()).unwrap();
        });

        let mut ex = TcpExchange::connect(addr, Duration::from_secs(5)).unwrap();
        let err = ex.exchange("client").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        server.join().unwrap();
    }
}
