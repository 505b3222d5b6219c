use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    // Stdout belongs to the chat transcript.
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    match parley::app::run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            tracing::error!(error = %error, "parley exited with an error");
            ExitCode::FAILURE
        }
    }
}
