//! `hfp-bridge` command line tool
//!
//! Scans for nearby devices, or connects to one handsfree/headset device
//! and loops its microphone back to its speaker.

use std::{path::PathBuf, process, time::Duration};

use bluer::Address;
use clap::{Parser, Subcommand};
use log::{info, warn};
use tokio::{select, signal, time};

use hfp_bridge::{AudioFormat, Config, Headset, Result, Tone, bluetooth::scan};

/// Poll interval while no audio link is up
const IDLE_POLL: Duration = Duration::from_millis(100);
/// Settle time between the audio link coming up and the first beep
const BEEP_DELAY: Duration = Duration::from_millis(1500);

#[derive(Parser)]
#[command(name = "hfp-bridge")]
#[command(about = "Bluetooth Hands-Free/Headset audio bridge")]
struct Cli {
   #[command(subcommand)]
   command: Commands,

   /// Configuration file path
   #[arg(short, long, global = true)]
   config: Option<PathBuf>,

   /// Enable debug logging
   #[arg(short, long, global = true)]
   debug: bool,
}

#[derive(Subcommand)]
enum Commands {
   /// List discoverable devices as JSON lines
   Scan {
      /// Discovery time in seconds
      #[arg(long, default_value_t = 4)]
      duration: u64,
   },
   /// Connect to a device and loop its audio back
   Connect {
      /// Device address, e.g. 00:11:22:33:44:55
      address: String,

      /// Sample format used for the loopback
      #[arg(long, default_value = "extended")]
      format: AudioFormat,

      /// Send RING once the control session is up
      #[arg(long)]
      ring: bool,

      #[arg(long, default_value_t = 300)]
      beep_ms: u32,

      #[arg(long, default_value_t = 1000.0)]
      beep_hz: f64,

      #[arg(long, default_value_t = 0.5)]
      beep_amplitude: f64,
   },
}

#[tokio::main]
async fn main() -> Result<()> {
   let cli = Cli::parse();

   let level = if cli.debug { "debug" } else { "info" };
   env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

   match cli.command {
      Commands::Scan { duration } => {
         for device in scan::scan(Duration::from_secs(duration)).await? {
            println!("{}", device.to_json());
         }
         Ok(())
      },
      Commands::Connect {
         address,
         format,
         ring,
         beep_ms,
         beep_hz,
         beep_amplitude,
      } => {
         let Ok(address) = address.parse::<Address>() else {
            eprintln!("Wrong device address: {address}");
            process::exit(1);
         };
         let config = match &cli.config {
            Some(path) => Config::load_from(path)?,
            None => Config::load()?,
         };
         let tone = Tone {
            duration_ms: beep_ms,
            frequency: beep_hz,
            amplitude: beep_amplitude,
         };

         let headset = Headset::connect(address, config);
         select! {
            () = loopback(&headset, format, tone, ring) => {},
            res = signal::ctrl_c() => res?,
         }
         headset.close().await;
         info!("Exiting...");
         Ok(())
      },
   }
}

async fn loopback(headset: &Headset, format: AudioFormat, tone: Tone, ring: bool) {
   let mut rung = false;
   while !headset.is_connected() {
      if ring && !rung && headset.ring() {
         info!("{}: Sent RING", headset.address());
         rung = true;
      }
      time::sleep(IDLE_POLL).await;
   }

   time::sleep(BEEP_DELAY).await;
   if !headset.beep(tone).await {
      warn!("{}: Beep failed", headset.address());
   }

   loop {
      match headset.read(format).await {
         Some(data) => {
            headset.write(&data, format).await;
         },
         None => time::sleep(IDLE_POLL).await,
      }
   }
}
