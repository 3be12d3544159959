use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("timeout elapsed")]
    Timeout(#[from] tokio::time::error::Elapsed),
    #[error("exhausted {0} attempts")]
    ExhaustedAttempts(usize),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{method} {url} returned {status}: {body}")]
    Api {
        method: &'static str,
        url: String,
        status: u16,
        body: String,
    },
    #[error("error parsing json")]
    Serde(#[from] serde_json::Error),
    #[error("error parsing yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("{0} environment variable must be set")]
    MissingCredential(&'static str),
    #[error("keystone returned a token that cannot be sent as a header")]
    InvalidToken,
    #[error("no {0} endpoint in the service catalog")]
    MissingEndpoint(&'static str),
    #[error("invalid topology at node '{node}': {reason}")]
    InvalidTopology { node: String, reason: String },
    #[error("{0} does not exist")]
    MissingFile(String),
    #[error("distribution [{0}] does not exist")]
    NoImage(String),
    #[error("image {image} has no {key} metadata")]
    MissingMetadata { image: String, key: &'static str },
    #[error("flavor {0} does not exist")]
    NoFlavor(String),
    #[error("instance {0} has no address")]
    NoAddress(String),
    #[error("instance {0} has not been built")]
    NotBuilt(String),
    #[error("instances still building after {secs}s: {}", .pending.join(", "))]
    BuildTimeout { pending: Vec<String>, secs: u64 },
    #[error("failed to build instance {instance}: status {status}")]
    BuildFailed { instance: String, status: String },
    #[error("snapshot {name} ended in status {status}")]
    SnapshotFailed { name: String, status: String },
    #[error("`{command}` failed with {code:?}: {stderr}")]
    Command {
        command: String,
        code: Option<i32>,
        stderr: String,
    },
    #[error("invalid pattern: {0}")]
    Regex(#[from] regex::Error),
    #[error("failed to update images: {}", .0.join(", "))]
    UpdateFailed(Vec<String>),
    #[error("'{0}' is not a valid puppet fact name")]
    InvalidFact(String),
    #[error("topology has no tester node")]
    NoTester,
    #[error("configuring {node} failed: {source}")]
    Configure {
        node: String,
        #[source]
        source: Box<Error>,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::Error;

    #[test]
    fn configure_error_names_the_node() {
        let err = Error::Configure {
            node: "pulp-consumer".into(),
            source: Box::new(Error::ExhaustedAttempts(30)),
        };
        assert_eq!(
            err.to_string(),
            "configuring pulp-consumer failed: exhausted 30 attempts"
        );
    }

    #[test]
    fn build_timeout_lists_pending_instances() {
        let err = Error::BuildTimeout {
            pending: vec!["a".into(), "b".into()],
            secs: 600,
        };
        assert_eq!(
            err.to_string(),
            "instances still building after 600s: a, b"
        );
    }
}
