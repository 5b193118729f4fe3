use malloy_cli::{CliMode, Dispatcher};

#[tokio::main]
async fn main() {
    // Parse CLI arguments and run the command; errors are already reported
    let dispatcher = Dispatcher::new(CliMode::Interactive);

    if let Err(e) = dispatcher.dispatch(std::env::args_os()).await {
        std::process::exit(e.exit_code());
    }
}
