use anyhow::Context;
use gcodelink::console::{execute, Control, HostCommand};
use gcodelink::{
    init_logging, list_ports, Config, EventDispatcher, LogFormat, SerialConnector, Session,
    BUILD_DATE, VERSION,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;

struct Args {
    config: Option<PathBuf>,
    log_format: LogFormat,
    list_ports: bool,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut args = Args {
        config: None,
        log_format: LogFormat::Pretty,
        list_ports: false,
    };
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--json-logs" => args.log_format = LogFormat::Json,
            "--list-ports" => args.list_ports = true,
            flag if flag.starts_with("--") => anyhow::bail!("Unknown option {}", flag),
            path => args.config = Some(PathBuf::from(path)),
        }
    }
    Ok(args)
}

fn load_config(path: Option<PathBuf>) -> anyhow::Result<Config> {
    let path = match path {
        Some(path) => path,
        None => match Config::default_path() {
            Ok(path) => path,
            Err(e) => {
                tracing::warn!("{}; using defaults", e);
                return Ok(Config::default());
            }
        },
    };
    Config::load_or_default(&path).with_context(|| format!("Loading {}", path.display()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = parse_args()?;
    init_logging(args.log_format)?;

    println!("gcodelink {} (built {})", VERSION, BUILD_DATE);

    if args.list_ports {
        for port in list_ports()? {
            println!("{}\t{}", port.port_name, port.description);
        }
        return Ok(());
    }

    let config = load_config(args.config)?;

    let dispatcher = EventDispatcher::default();
    let mut events = dispatcher.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => println!("{}", event),
                Err(RecvError::Lagged(missed)) => {
                    tracing::warn!("Console fell behind, {} messages dropped", missed)
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    let session = Session::new(
        Arc::new(SerialConnector),
        config.connection_params(),
        config.transport_config(),
        dispatcher.sinks(),
    );
    if let Err(e) = session.connect().await {
        println!("error: {} (use !connect to retry)", e);
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let command = match line {
            Some(line) => HostCommand::parse(&line),
            None => Ok(HostCommand::Quit),
        };
        let outcome = match command {
            Ok(command) => execute(&session, command).await,
            Err(e) => Err(e),
        };
        match outcome {
            Ok(Control::Continue) => {}
            Ok(Control::Quit) => break,
            Err(e) => println!("error: {:#}", e),
        }
    }

    Ok(())
}
