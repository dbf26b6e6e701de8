//! dissect CLI entry point: replay a pcap file through the kernel and
//! print TCP session events.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use dissect::{Kernel, PcapFileSource, Property};

#[derive(Parser)]
#[command(name = "dissect", version, about = "Streaming packet dissection")]
struct Args {
    /// Pcap file to replay
    file: PathBuf,

    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let filter = match args.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .init();

    let mut kernel = Kernel::new()?;

    let p_id = kernel.decoder().param_id("tcp.id");
    let p_rtt = kernel.decoder().param_id("tcp.rtt_3wh");
    let p_tx_server = kernel.decoder().param_id("tcp.tx_server");
    let p_tx_client = kernel.decoder().param_id("tcp.tx_client");

    kernel
        .on("new_session", move |prop| {
            let id = p_id.and_then(|p| prop.value(p)).and_then(|v| v.u64());
            println!("[{}] new session  {}", id.unwrap_or(0), flow(prop));
        })
        .expect("tcp module events are registered");
    kernel
        .on("established", move |prop| {
            let id = p_id.and_then(|p| prop.value(p)).and_then(|v| v.u64());
            let rtt = p_rtt.and_then(|p| prop.value(p)).and_then(|v| v.u32());
            println!(
                "[{}] established  {}  rtt={}us",
                id.unwrap_or(0),
                flow(prop),
                rtt.unwrap_or(0)
            );
        })
        .expect("tcp module events are registered");
    kernel
        .on("closed", move |prop| {
            let id = p_id.and_then(|p| prop.value(p)).and_then(|v| v.u64());
            let tx_s = p_tx_server.and_then(|p| prop.value(p)).and_then(|v| v.u64());
            let tx_c = p_tx_client.and_then(|p| prop.value(p)).and_then(|v| v.u64());
            println!(
                "[{}] closed  {}  to_server={}B to_client={}B",
                id.unwrap_or(0),
                flow(prop),
                tx_s.unwrap_or(0),
                tx_c.unwrap_or(0)
            );
        })
        .expect("tcp module events are registered");

    let running = kernel.start();
    let channel = running.channel();

    let mut source = PcapFileSource::open(&args.file)
        .with_context(|| format!("failed to open pcap file: {}", args.file.display()))?;
    let frames = source.feed(&channel)?;

    let kernel = running.join();
    eprintln!(
        "{} frames read, {} packets decoded, {} bytes",
        frames,
        kernel.recv_pkt(),
        kernel.recv_size()
    );
    Ok(())
}

fn flow(prop: &Property<'_>) -> String {
    match (prop.src_addr(), prop.dst_addr()) {
        (Some(src), Some(dst)) => {
            format!("{}:{} -> {}:{}", src, prop.src_port(), dst, prop.dst_port())
        }
        _ => "?".into(),
    }
}
