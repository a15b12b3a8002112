use tracing::error;
use tracing_subscriber::EnvFilter;

use ox_config::Cli;

#[cfg(feature = "jemalloc")]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[cfg(all(feature = "mimalloc", not(feature = "jemalloc")))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

const HELP: &str = "\
oxidis - in-memory key-value server

USAGE:
    oxidis [OPTIONS]

OPTIONS:
    -h, --host <HOST>              Host to bind to (default: 0.0.0.0)
    -p, --port <PORT>              Port to listen on (default: 6380)
        --idle-timeout-ms <MS>     Idle connection timeout (default: 60000)
    -v, --version                  Print version information
        --help                     Print this help message
";

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let cli = match ox_config::parse_args(&args) {
        Ok(cli) => cli,
        Err(e) => {
            eprintln!("oxidis: {e}");
            eprint!("{HELP}");
            std::process::exit(2);
        }
    };
    match cli {
        Cli::Help => print!("{HELP}"),
        Cli::Version => println!("oxidis {}", env!("CARGO_PKG_VERSION")),
        Cli::Run(config) => {
            tracing_subscriber::fmt()
                .with_env_filter(
                    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
                )
                .init();
            if let Err(e) = ox_server::run(&config) {
                error!(error = %e, "server terminated");
                std::process::exit(1);
            }
        }
    }
}
