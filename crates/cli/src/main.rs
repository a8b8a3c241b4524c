use clap::{Parser, Subcommand};
use retriever::{
    AxisUrlParams, Callbacks, MediaSelection, Retriever, RetrieverConfig, SessionState,
    TransportMode, build_axis_rtsp_url,
};
use std::io;
use std::process::ExitCode;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

#[derive(Parser)]
#[command(
    name = "rtsp-retriever",
    about = "Retrieve video frames and scene metadata from an RTSP camera"
)]
struct Args {
    #[command(subcommand)]
    source: Source,

    /// Only set up the video stream
    #[arg(long, global = true, conflicts_with = "only_application_data")]
    only_video: bool,

    /// Only set up the scene metadata stream
    #[arg(long, global = true)]
    only_application_data: bool,

    /// trace, debug, info, warn or error
    #[arg(long, global = true, default_value = "info")]
    log_level: tracing::Level,

    /// Negotiation timeout in seconds
    #[arg(long, global = true, default_value_t = 30)]
    connection_timeout: u64,

    /// Receive RTP over UDP instead of interleaved on the control connection
    #[arg(long, global = true)]
    udp: bool,

    /// Stop after this many seconds (default: until Enter is pressed)
    #[arg(long, global = true)]
    duration: Option<u64>,
}

#[derive(Subcommand)]
enum Source {
    /// Connect to an Axis device by address
    Device {
        #[arg(long, env = "AX_DEVIL_TARGET_ADDR")]
        ip: String,
        #[arg(long, env = "AX_DEVIL_TARGET_USER", default_value = "")]
        username: String,
        #[arg(long, env = "AX_DEVIL_TARGET_PASS", default_value = "", hide_env_values = true)]
        password: String,
        /// Video source (camera head) index
        #[arg(long, default_value_t = 1)]
        source: u32,
        /// Do not request the ONVIF replay RTP header extension
        #[arg(long)]
        no_rtp_ext: bool,
        /// WIDTHxHEIGHT
        #[arg(long)]
        resolution: Option<String>,
    },
    /// Connect to an explicit rtsp:// URL
    Url { url: String },
}

fn main() -> ExitCode {
    let args = Args::parse();
    tracing_subscriber::fmt().with_max_level(args.log_level).init();

    let url = match &args.source {
        Source::Device {
            ip,
            username,
            password,
            source,
            no_rtp_ext,
            resolution,
        } => {
            let params = AxisUrlParams {
                address: ip.clone(),
                username: username.clone(),
                password: password.clone(),
                video_source: *source,
                get_video_data: !args.only_application_data,
                get_application_data: !args.only_video,
                rtp_ext: !no_rtp_ext,
                resolution: resolution.clone(),
            };
            match build_axis_rtsp_url(&params) {
                Ok(url) => url,
                Err(e) => {
                    eprintln!("Invalid device parameters: {}", e);
                    return ExitCode::FAILURE;
                }
            }
        }
        Source::Url { url } => url.clone(),
    };

    let mut config = RetrieverConfig::new(url);
    if args.only_video || args.only_application_data {
        config.media = MediaSelection {
            video: !args.only_application_data,
            application: !args.only_video,
        };
    }
    if args.udp {
        config.transport = TransportMode::Udp;
    }
    config.negotiation_timeout = Duration::from_secs(args.connection_timeout);

    let (done_tx, done_rx) = mpsc::channel();
    let fatal_tx = done_tx.clone();
    let callbacks = Callbacks::new()
        .on_session_start(|start| {
            tracing::info!(
                media = %start.stream.media_kind,
                encoding = %start.stream.encoding,
                payload_type = start.stream.payload_type,
                geometry = ?start.stream.geometry,
                session_id = %start.session_id,
                "stream started"
            );
        })
        .on_video(|unit| {
            let capture_time = unit
                .rtp_info
                .extension
                .as_ref()
                .and_then(|e| e.ntp_timestamp.to_system_time());
            tracing::info!(
                bytes = unit.payload.len(),
                rtp_timestamp = unit.rtp_info.timestamp,
                sequence = unit.rtp_info.sequence,
                capture_time = ?capture_time,
                lost_packets = unit.diagnostics.lost_packets,
                "video frame"
            );
        })
        .on_application_data(|unit| {
            println!("{}", String::from_utf8_lossy(&unit.payload));
        })
        .on_error(move |event| {
            if event.fatal {
                tracing::error!(code = %event.code, "{}", event.message);
                let _ = fatal_tx.send(());
            } else {
                tracing::warn!(code = %event.code, "{}", event.message);
            }
        });

    let retriever = Retriever::new(config, callbacks);
    if let Err(e) = retriever.start() {
        eprintln!("Failed to start retriever: {}", e);
        return ExitCode::FAILURE;
    }

    thread::spawn(move || {
        let mut input = String::new();
        let _ = io::stdin().read_line(&mut input);
        let _ = done_tx.send(());
    });
    match args.duration {
        Some(secs) => {
            println!("Receiving for {} s, press Enter to stop early", secs);
            let _ = done_rx.recv_timeout(Duration::from_secs(secs));
        }
        None => {
            println!("Receiving, press Enter to stop");
            let _ = done_rx.recv();
        }
    }

    let failed = retriever.state() == SessionState::Failed;
    retriever.stop();
    if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
