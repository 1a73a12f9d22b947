//! Configuration structures and loading logic

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];
const LOG_FORMATS: [&str; 2] = ["json", "pretty"];
const MAX_THREADS: usize = 1024;

/// Server configuration
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// ONNX model file served by this process
    pub model_path: PathBuf,
    pub address: String,
    pub http_port: u16,
    pub grpc_port: u16,

    /// Worker threads of the async runtime
    pub num_threads: usize,

    pub log_level: String,
    pub log_format: String,

    /// Upper bound on a single model run; unbounded when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_timeout_secs: Option<u64>,

    /// Cap on bytes held by live input tensors; unbounded when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allocator_budget_mb: Option<usize>,

    /// HTTP body limit and gRPC message limit
    pub max_message_size_mb: usize,

    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::new(),
            address: default_address(),
            http_port: default_http_port(),
            grpc_port: default_grpc_port(),
            num_threads: default_num_threads(),
            log_level: "info".to_string(),
            log_format: "json".to_string(),
            request_timeout_secs: None,
            allocator_budget_mb: None,
            max_message_size_mb: default_max_message_size_mb(),
            max_connections: default_max_connections(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from file with environment variable overrides
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content).context("Failed to parse TOML config")?
        } else {
            Self::default()
        };

        // Environment variable overrides
        if let Ok(model_path) = std::env::var("ONNX_SERVING_MODEL_PATH") {
            config.model_path = PathBuf::from(model_path);
        }
        if let Ok(address) = std::env::var("ONNX_SERVING_ADDRESS") {
            config.address = address;
        }
        if let Ok(port) = std::env::var("ONNX_SERVING_HTTP_PORT") {
            config.http_port = port
                .parse()
                .context("Invalid ONNX_SERVING_HTTP_PORT value")?;
        }
        if let Ok(port) = std::env::var("ONNX_SERVING_GRPC_PORT") {
            config.grpc_port = port
                .parse()
                .context("Invalid ONNX_SERVING_GRPC_PORT value")?;
        }
        if let Ok(threads) = std::env::var("ONNX_SERVING_NUM_THREADS") {
            config.num_threads = threads
                .parse()
                .context("Invalid ONNX_SERVING_NUM_THREADS value")?;
        }
        if let Ok(level) = std::env::var("ONNX_SERVING_LOG_LEVEL") {
            config.log_level = level;
        }
        if let Ok(timeout) = std::env::var("ONNX_SERVING_REQUEST_TIMEOUT_SECS") {
            config.request_timeout_secs = Some(
                timeout
                    .parse()
                    .context("Invalid ONNX_SERVING_REQUEST_TIMEOUT_SECS value")?,
            );
        }

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.model_path.as_os_str().is_empty() {
            anyhow::bail!("Model path is required (--model-path or ONNX_SERVING_MODEL_PATH)");
        }
        if !self.model_path.is_file() {
            anyhow::bail!("Model path {:?} is not a readable file", self.model_path);
        }

        if self.http_port == 0 || self.grpc_port == 0 {
            anyhow::bail!(
                "Ports must be non-zero (http {}, grpc {})",
                self.http_port,
                self.grpc_port
            );
        }
        if self.http_port == self.grpc_port {
            anyhow::bail!(
                "HTTP and gRPC ports must differ (both {})",
                self.http_port
            );
        }
        self.ip_addr()?;

        if !(1..=MAX_THREADS).contains(&self.num_threads) {
            anyhow::bail!(
                "Thread count must be between 1 and {} (got {})",
                MAX_THREADS,
                self.num_threads
            );
        }

        if !LOG_LEVELS.contains(&self.log_level.as_str()) {
            anyhow::bail!(
                "Invalid log level '{}' (expected one of {})",
                self.log_level,
                LOG_LEVELS.join(", ")
            );
        }
        if !LOG_FORMATS.contains(&self.log_format.as_str()) {
            anyhow::bail!(
                "Invalid log format '{}' (expected json or pretty)",
                self.log_format
            );
        }

        if self.allocator_budget_mb == Some(0) {
            anyhow::bail!("Allocator budget must be greater than zero");
        }
        if self.max_message_size_mb == 0 {
            anyhow::bail!("Maximum message size must be greater than zero");
        }
        if self.max_connections == 0 {
            anyhow::bail!("Connection limit must be greater than zero");
        }
        if self.request_timeout_secs == Some(0) {
            anyhow::bail!("Request timeout must be greater than zero");
        }

        Ok(())
    }

    fn ip_addr(&self) -> Result<IpAddr> {
        self.address
            .parse()
            .with_context(|| format!("Invalid listen address '{}'", self.address))
    }

    pub fn http_addr(&self) -> Result<SocketAddr> {
        Ok(SocketAddr::new(self.ip_addr()?, self.http_port))
    }

    pub fn grpc_addr(&self) -> Result<SocketAddr> {
        Ok(SocketAddr::new(self.ip_addr()?, self.grpc_port))
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_secs.map(Duration::from_secs)
    }

    pub fn allocator_budget_bytes(&self) -> Option<usize> {
        self.allocator_budget_mb
            .map(|mb| mb.saturating_mul(1024 * 1024))
    }

    pub fn max_message_size_bytes(&self) -> usize {
        self.max_message_size_mb.saturating_mul(1024 * 1024)
    }
}

// Default functions
fn default_address() -> String {
    "0.0.0.0".to_string()
}
fn default_http_port() -> u16 {
    8001
}
fn default_grpc_port() -> u16 {
    50051
}
fn default_num_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
        .min(MAX_THREADS)
}
fn default_max_message_size_mb() -> usize {
    64
}
fn default_max_connections() -> usize {
    1024
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn valid_config(model: &NamedTempFile) -> ServerConfig {
        ServerConfig {
            model_path: model.path().to_path_buf(),
            ..Default::default()
        }
    }

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.address, "0.0.0.0");
        assert_eq!(config.http_port, 8001);
        assert_eq!(config.grpc_port, 50051);
        assert_eq!(config.max_message_size_mb, 64);
        assert!(config.num_threads >= 1);
        assert!(config.request_timeout().is_none());
    }

    #[test]
    fn test_valid_config() {
        let model = NamedTempFile::new().unwrap();
        assert!(valid_config(&model).validate().is_ok());
    }

    #[test]
    fn test_missing_model_path() {
        assert!(ServerConfig::default().validate().is_err());

        let config = ServerConfig {
            model_path: PathBuf::from("/nonexistent/model.onnx"),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_port_validation() {
        let model = NamedTempFile::new().unwrap();

        let config = ServerConfig {
            http_port: 0,
            ..valid_config(&model)
        };
        assert!(config.validate().is_err());

        let config = ServerConfig {
            http_port: 9000,
            grpc_port: 9000,
            ..valid_config(&model)
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_thread_count_validation() {
        let model = NamedTempFile::new().unwrap();

        for threads in [0, 1025, 10_000] {
            let config = ServerConfig {
                num_threads: threads,
                ..valid_config(&model)
            };
            assert!(config.validate().is_err(), "threads = {threads}");
        }

        let config = ServerConfig {
            num_threads: 1024,
            ..valid_config(&model)
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_address_and_log_validation() {
        let model = NamedTempFile::new().unwrap();

        let config = ServerConfig {
            address: "not-an-ip".to_string(),
            ..valid_config(&model)
        };
        assert!(config.validate().is_err());

        let config = ServerConfig {
            log_level: "verbose".to_string(),
            ..valid_config(&model)
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_limits_rejected() {
        let model = NamedTempFile::new().unwrap();

        let config = ServerConfig {
            allocator_budget_mb: Some(0),
            ..valid_config(&model)
        };
        assert!(config.validate().is_err());

        let config = ServerConfig {
            max_connections: 0,
            ..valid_config(&model)
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_toml() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
model_path = "/models/mnist.onnx"
http_port = 9001
num_threads = 2
request_timeout_secs = 5
allocator_budget_mb = 256
"#
        )
        .unwrap();

        let config = ServerConfig::load(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(config.model_path, PathBuf::from("/models/mnist.onnx"));
        assert_eq!(config.http_port, 9001);
        assert_eq!(config.grpc_port, 50051);
        assert_eq!(config.num_threads, 2);
        assert_eq!(config.request_timeout(), Some(Duration::from_secs(5)));
        assert_eq!(config.allocator_budget_bytes(), Some(256 * 1024 * 1024));
    }

    #[test]
    fn test_byte_limits_saturate() {
        let config = ServerConfig {
            max_message_size_mb: usize::MAX / 2,
            allocator_budget_mb: Some(usize::MAX),
            ..Default::default()
        };
        assert_eq!(config.max_message_size_bytes(), usize::MAX);
        assert_eq!(config.allocator_budget_bytes(), Some(usize::MAX));
        assert_eq!(ServerConfig::default().max_message_size_bytes(), 64 * 1024 * 1024);
    }

    #[test]
    fn test_socket_addresses() {
        let config = ServerConfig {
            address: "127.0.0.1".to_string(),
            ..Default::default()
        };
        assert_eq!(
            config.http_addr().unwrap(),
            "127.0.0.1:8001".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(
            config.grpc_addr().unwrap(),
            "127.0.0.1:50051".parse::<SocketAddr>().unwrap()
        );
    }
}
