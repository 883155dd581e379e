use anyhow::{bail, Context, Result};
use lightshow_core::config::LinkConfig;
use lightshow_core::demo::SimulatedDevice;
use lightshow_core::prelude::*;
use lightshow_core::protocol::{list_ports, solid_frame};
use std::env;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const USAGE: &str = "\
Usage: lightshow [options]

Options:
  --list                List serial ports and exit
  --port <name>         Connect to this port instead of probing every port
  --demo <leds>         Drive a simulated controller with <leds> LEDs
  --config <path>       Link settings (default: user config directory)
  --color <r,g,b>       Colour sent in reply to frame requests (default 255,0,0)
  --seconds <n>         Stop after n seconds (default: run until Ctrl-C)
  --send <type[:hex]>   Send one message after connecting, e.g. 0 or 3:07e007e0
  --save-config         Write the effective settings to the config path";

#[derive(Debug, Default)]
struct Args {
    list: bool,
    port: Option<String>,
    demo: Option<u8>,
    config: Option<PathBuf>,
    color: (u8, u8, u8),
    seconds: Option<u64>,
    send: Vec<(u8, Vec<u8>)>,
    save_config: bool,
}

impl Args {
    fn parse() -> Result<Self> {
        let mut args = Args {
            color: (255, 0, 0),
            ..Args::default()
        };
        let mut iter = env::args().skip(1);
        while let Some(arg) = iter.next() {
            match arg.as_str() {
                "--list" => args.list = true,
                "--save-config" => args.save_config = true,
                "--port" => args.port = Some(value(&mut iter, "--port")?),
                "--config" => args.config = Some(value(&mut iter, "--config")?.into()),
                "--demo" => {
                    let leds = value(&mut iter, "--demo")?;
                    args.demo = Some(leds.parse().context("--demo expects 0-255")?);
                }
                "--seconds" => {
                    let n = value(&mut iter, "--seconds")?;
                    args.seconds = Some(n.parse().context("--seconds expects a number")?);
                }
                "--send" => args.send.push(parse_message(&value(&mut iter, "--send")?)?),
                "--color" => args.color = parse_color(&value(&mut iter, "--color")?)?,
                "-h" | "--help" => {
                    println!("{}", USAGE);
                    std::process::exit(0);
                }
                other => bail!("unknown option {}\n\n{}", other, USAGE),
            }
        }
        Ok(args)
    }
}

fn value(iter: &mut impl Iterator<Item = String>, flag: &str) -> Result<String> {
    iter.next().with_context(|| format!("{} needs a value", flag))
}

fn parse_color(s: &str) -> Result<(u8, u8, u8)> {
    let parts: Vec<&str> = s.split(',').map(str::trim).collect();
    let [r, g, b] = parts.as_slice() else {
        bail!("--color expects r,g,b");
    };
    Ok((r.parse()?, g.parse()?, b.parse()?))
}

/// `type` or `type:hexpayload`, type in decimal or 0x-prefixed hex
fn parse_message(s: &str) -> Result<(u8, Vec<u8>)> {
    let (kind, payload) = s.split_once(':').unwrap_or((s, ""));
    let kind = match kind.strip_prefix("0x") {
        Some(hex) => u8::from_str_radix(hex, 16),
        None => kind.parse(),
    }
    .with_context(|| format!("bad message type in {:?}", s))?;

    if !payload.is_ascii() || payload.len() % 2 != 0 {
        bail!("payload {:?} is not a whole number of hex bytes", payload);
    }
    let bytes = (0..payload.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&payload[i..i + 2], 16))
        .collect::<Result<Vec<u8>, _>>()
        .with_context(|| format!("bad hex payload {:?}", payload))?;
    Ok((kind, bytes))
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_config(args: &Args) -> Result<(LinkConfig, PathBuf)> {
    let path = match &args.config {
        Some(path) => path.clone(),
        None => LinkConfig::default_path().context("no config directory")?,
    };
    let config = LinkConfig::load_or_default(&path)
        .with_context(|| format!("reading {}", path.display()))?;
    Ok((config, path))
}

/// Answer every frame request with a solid colour and log framing errors
fn serve_frames(link: &Arc<LightLink>, (r, g, b): (u8, u8, u8)) {
    // Weak: the handler is owned by the link itself
    let weak: Weak<LightLink> = Arc::downgrade(link);
    link.on_message(MessageType::FrameRequest.byte(), move |payload| {
        let Some(link) = weak.upgrade() else {
            return;
        };
        let count = payload.first().copied().unwrap_or(0);
        tracing::debug!("frame request for {} LEDs", count);
        if let Err(e) = link.send(MessageType::FrameResponse.byte(), &solid_frame(count, r, g, b)) {
            tracing::warn!("frame response failed: {}", e);
        }
    });
    link.on_error(|e| tracing::warn!("framing error: {}", e));
}

async fn run_until_stopped(seconds: Option<u64>) {
    match seconds {
        Some(n) => tokio::time::sleep(Duration::from_secs(n)).await,
        None => {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!("could not wait for Ctrl-C: {}", e);
            }
        }
    }
}

async fn run_demo(link: &Arc<LightLink>, leds: u8, seconds: Option<u64>) -> Result<()> {
    let (mut device, host) = SimulatedDevice::start(leds);
    link.attach("demo", Box::new(host)).await?;
    println!("Driving simulated controller with {} LEDs", device.led_count());

    let mut ticker = tokio::time::interval(Duration::from_millis(50));
    let stop = run_until_stopped(seconds);
    tokio::pin!(stop);
    loop {
        tokio::select! {
            _ = &mut stop => break,
            _ = ticker.tick() => device.request_frame()?,
        }
    }

    link.disconnect().await;
    println!("Simulated controller received {} frames", device.frames().len());
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse()?;

    if args.list {
        for port in list_ports() {
            match (&port.product, port.vid, port.pid) {
                (Some(product), Some(vid), Some(pid)) => {
                    println!("{}  {} [{:04x}:{:04x}]", port.name, product, vid, pid)
                }
                _ => println!("{}", port.name),
            }
        }
        return Ok(());
    }

    let (config, config_path) = load_config(&args)?;
    if args.save_config {
        config
            .save(&config_path)
            .with_context(|| format!("writing {}", config_path.display()))?;
        println!("Saved settings to {}", config_path.display());
    }

    let link = Arc::new(LightLink::new(config));
    serve_frames(&link, args.color);

    if let Some(leds) = args.demo {
        return run_demo(&link, leds, args.seconds).await;
    }

    let port = link
        .connect(args.port.as_deref())
        .await
        .context("could not connect to a LightShow controller")?;
    println!("Connected on {}", port);
    for (kind, payload) in &args.send {
        link.send(*kind, payload)
            .with_context(|| format!("sending message {:#04x}", kind))?;
    }

    run_until_stopped(args.seconds).await;
    if !link.is_acknowledged() {
        println!("Device on {} never answered the greeting", port);
    }
    if let Some(stats) = link.stats() {
        println!(
            "{} bytes received, {} packets decoded, {} framing errors",
            stats.bytes_received, stats.packets_decoded, stats.framing_errors
        );
    }
    link.disconnect().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_color() {
        assert_eq!(parse_color("1, 2,3").unwrap(), (1, 2, 3));
        assert!(parse_color("1,2").is_err());
        assert!(parse_color("1,2,300").is_err());
    }

    #[test]
    fn test_parse_message() {
        assert_eq!(parse_message("0").unwrap(), (0, vec![]));
        assert_eq!(parse_message("3:07e055").unwrap(), (3, vec![0x07, 0xE0, 0x55]));
        assert_eq!(parse_message("0x10:").unwrap(), (0x10, vec![]));
        assert!(parse_message("3:abc").is_err());
        assert!(parse_message("300").is_err());
        assert!(parse_message("2:zz").is_err());
    }
}
