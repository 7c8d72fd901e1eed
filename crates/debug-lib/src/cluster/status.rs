//! Remote process exit status

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Status;

/// How a remote process ended, as reported on the stream's status channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitStatus {
    /// Process exited with code 0
    Success,
    /// Process exited with a non-zero code
    Code(i32),
    /// Stream failed for a reason other than the process exit code
    Failure(String),
    /// Stream closed without reporting a status
    Unknown,
}

impl ExitStatus {
    /// Interpret the status object sent by the API server when a stream ends.
    ///
    /// Non-zero exits arrive as `Failure` with reason `NonZeroExitCode` and the
    /// code in an `ExitCode` cause.
    pub fn from_status(status: Option<&Status>) -> Self {
        let Some(status) = status else {
            return ExitStatus::Unknown;
        };

        if status.status.as_deref() == Some("Success") {
            return ExitStatus::Success;
        }

        if status.reason.as_deref() == Some("NonZeroExitCode") {
            let code = status
                .details
                .as_ref()
                .and_then(|d| d.causes.as_ref())
                .and_then(|causes| {
                    causes
                        .iter()
                        .find(|c| c.reason.as_deref() == Some("ExitCode"))
                })
                .and_then(|c| c.message.as_deref())
                .and_then(|m| m.trim().parse::<i32>().ok());

            if let Some(code) = code {
                return ExitStatus::Code(code);
            }
        }

        ExitStatus::Failure(
            status
                .message
                .clone()
                .unwrap_or_else(|| "remote stream failed".to_string()),
        )
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ExitStatus::Success)
    }
}
