use dvt_core::client::ClientError;
use dvt_core::logging;

mod cli;

use crate::cli::CliCommand;

/// Exit codes: 0 success, 1 argument error, 2 network error, 3 job failed.
fn exit_code_for(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<ClientError>() {
        Some(ClientError::Rejected(_)) => 1,
        Some(ClientError::Network(_)) | Some(ClientError::Io(_)) => 2,
        Some(ClientError::JobFailed(_)) => 3,
        None => 1,
    }
}

#[tokio::main]
async fn main() {
    logging::init();

    if let Err(err) = CliCommand::run_from_args().await {
        eprintln!("dvt error: {:#}", err);
        std::process::exit(exit_code_for(&err));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dvt_core::wire::WireError;

    #[test]
    fn exit_codes_follow_error_class() {
        let rejected: anyhow::Error = ClientError::Rejected("bad width".to_string()).into();
        assert_eq!(exit_code_for(&rejected), 1);

        let network: anyhow::Error = ClientError::Network(WireError::Closed).into();
        assert_eq!(exit_code_for(&network), 2);

        let failed: anyhow::Error =
            ClientError::JobFailed("failed:shard-exhausted".to_string()).into();
        assert_eq!(exit_code_for(&failed), 3);

        let other = anyhow::anyhow!("config unreadable");
        assert_eq!(exit_code_for(&other), 1);
    }
}
