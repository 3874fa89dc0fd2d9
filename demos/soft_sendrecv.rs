use rcverbs::ctrl::{ConnConfig, Connecter, TcpExchange};
use rcverbs::provider::soft::SoftFabric;
use rcverbs::*;
use std::net::{Ipv4Addr, TcpListener};
use std::thread;
use std::time::Duration;

const PORT: u16 = TcpExchange::DEFAULT_PORT;
const TIMEOUT: Duration = Duration::from_secs(5);

fn client(fabric: SoftFabric) -> anyhow::Result<()> {
    let cfg = ConnConfig::default();
    let ctx = Context::new(fabric.open_device(), cfg.port_num, cfg.gid_index)?;
    let pd = Pd::new(&ctx)?;
    let cq = cfg.new_cq(&ctx)?;

    let exchange = TcpExchange::connect((Ipv4Addr::LOCALHOST, PORT), TIMEOUT)?;
    let conn = Connecter::new(exchange, cfg.clone()).connect(&pd, &cq)?;

    // Send the message to the server.
    let mem = Mr::reg(&pd, "Hello, rcverbs!".as_bytes().to_vec(), Permission::default())?;
    conn.qp().post_send(0, &[mem.as_slice()], true)?;

    let mut reactor = cfg.new_reactor(&cq)?;
    match reactor.collect(1, TIMEOUT)?.pop() {
        Some(r) if r.is_success() => Ok(()),
        Some(r) => Err(anyhow::anyhow!("send failed: {}", r.status())),
        None => Err(anyhow::anyhow!("send timed out")),
    }
}

fn main() -> anyhow::Result<()> {
    // Both endpoints share one in-process fabric.
    let fabric = SoftFabric::new();
    let cfg = ConnConfig::default();
    let ctx = Context::new(fabric.open_device(), cfg.port_num, cfg.gid_index)?;
    let pd = Pd::new(&ctx)?;
    let cq = cfg.new_cq(&ctx)?;

    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, PORT))?;
    let cli = thread::spawn(move || client(fabric));
    let exchange = TcpExchange::accept(&listener)?;

    // Receive a message from the client. The receive is posted before RTS.
    let mut mem = Mr::alloc(&pd, 4096, Permission::default())?;
    let conn = Connecter::new(exchange, cfg.clone())
        .connect_with(&pd, &cq, |qp| qp.post_recv(0, &[mem.as_slice()]))?;
    log::info!("connected to QP {:#x}", conn.peer().qpn());

    let mut reactor = cfg.new_reactor(&cq)?;
    let record = reactor
        .collect(1, TIMEOUT)?
        .pop()
        .ok_or_else(|| anyhow::anyhow!("receive timed out"))?;
    let len = record.byte_len().unwrap_or_default();
    println!("{}", String::from_utf8_lossy(&mem.bytes()?[..len]));

    cli.join().unwrap()?;
    conn.close()?;
    Ok(())
}
