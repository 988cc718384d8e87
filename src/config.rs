use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("`{field}` is required when LLM_PROVIDER is `{provider}`")]
    Missing {
        provider: &'static str,
        field: &'static str,
    },
    #[error("unknown LLM_PROVIDER `{0}`")]
    UnknownProvider(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum LlmSettings {
    TensorZero {
        gateway_url: String,
        api_key: Option<String>,
        function_name: Option<String>,
        model: Option<String>,
    },
    OpenAi {
        base_url: String,
        api_key: Option<String>,
        model: String,
    },
    Anthropic {
        base_url: String,
        api_key: String,
        model: String,
    },
}

/// Knobs for the stage functions. Cheap to clone; one copy per pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub relevancy_weight: f64,
    pub price_weight: f64,
    pub relevancy_gamma: f64,
    pub max_price_ratio: f64,
    pub max_pages_to_search: u32,
    pub listings_batch_size: usize,
    pub enable_markdown: bool,
    pub debug_scoring: bool,
    pub stream_buffer: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            relevancy_weight: 1.0,
            price_weight: 1.0,
            relevancy_gamma: 1.5,
            max_price_ratio: 5.0,
            max_pages_to_search: 20,
            listings_batch_size: 20,
            enable_markdown: true,
            debug_scoring: false,
            stream_buffer: 64,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OlxSettings {
    pub graphql_url: String,
    pub page_limit: u32,
    pub min_request_interval: Duration,
}

impl Default for OlxSettings {
    fn default() -> Self {
        Self {
            graphql_url: "https://www.olx.bg/apigateway/graphql".into(),
            page_limit: 40,
            min_request_interval: Duration::from_millis(1000),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpSettings {
    pub timeout: Duration,
    pub connect_timeout: Duration,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub llm: LlmSettings,
    pub pipeline: PipelineConfig,
    pub olx: OlxSettings,
    pub http: HttpSettings,
    pub port: u16,
    pub request_max_bytes: usize,
    /// Required `X-Metrics-Key` value for `/metrics`, when set.
    pub metrics_key: Option<String>,
    /// Required `X-Docs-Key` value for `/openapi.json`, when set.
    pub docs_key: Option<String>,
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds settings from an arbitrary key lookup so tests never touch the process env.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let llm = llm_settings(&get)?;

        let defaults = PipelineConfig::default();
        let pipeline = PipelineConfig {
            relevancy_weight: parse_positive(get("RELEVANCY_SCORE_WEIGHT"))
                .unwrap_or(defaults.relevancy_weight),
            price_weight: parse_positive(get("PRICE_SCORE_WEIGHT"))
                .unwrap_or(defaults.price_weight),
            relevancy_gamma: parse_positive(get("RELEVANCY_GAMMA"))
                .unwrap_or(defaults.relevancy_gamma),
            max_price_ratio: parse_positive(get("MAX_PRICE_RATIO"))
                .unwrap_or(defaults.max_price_ratio),
            max_pages_to_search: parse_count(get("MAX_PAGES_TO_SEARCH"))
                .unwrap_or(defaults.max_pages_to_search as usize) as u32,
            listings_batch_size: parse_count(get("LISTINGS_BATCH_SIZE"))
                .unwrap_or(defaults.listings_batch_size),
            enable_markdown: get("ENABLE_MARKDOWN")
                .map(|v| parse_bool(&v))
                .unwrap_or(defaults.enable_markdown),
            debug_scoring: get("DEBUG_SCORING")
                .map(|v| parse_bool(&v))
                .unwrap_or(defaults.debug_scoring),
            stream_buffer: parse_count(get("STREAM_BUFFER")).unwrap_or(defaults.stream_buffer),
        };

        let olx_defaults = OlxSettings::default();
        let olx = OlxSettings {
            graphql_url: get("OLX_GRAPHQL_URL").unwrap_or(olx_defaults.graphql_url),
            page_limit: parse_count(get("OLX_PAGE_LIMIT"))
                .map(|v| v as u32)
                .unwrap_or(olx_defaults.page_limit),
            min_request_interval: get("OLX_MIN_REQUEST_INTERVAL_MS")
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_millis)
                .unwrap_or(olx_defaults.min_request_interval),
        };

        let http_defaults = HttpSettings::default();
        let http = HttpSettings {
            timeout: get("HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(http_defaults.timeout),
            connect_timeout: get("HTTP_CONNECT_TIMEOUT_SECS")
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(http_defaults.connect_timeout),
        };

        Ok(Self {
            llm,
            pipeline,
            olx,
            http,
            port: get("PORT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(8000),
            request_max_bytes: parse_count(get("REQUEST_MAX_BYTES")).unwrap_or(256 * 1024),
            metrics_key: get("METRICS_KEY"),
            docs_key: get("OPENAPI_KEY"),
        })
    }
}

fn llm_settings<G>(get: &G) -> Result<LlmSettings, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    let provider = get("LLM_PROVIDER")
        .map(|p| p.to_lowercase())
        .unwrap_or_else(|| "tensorzero".into());
    match provider.as_str() {
        "tensorzero" => Ok(LlmSettings::TensorZero {
            gateway_url: get("TENSORZERO_GATEWAY_URL")
                .unwrap_or_else(|| "http://localhost:3000".into()),
            api_key: get("TENSORZERO_API_KEY"),
            function_name: get("TENSORZERO_FUNCTION"),
            model: get("TENSORZERO_MODEL"),
        }),
        "openai" => {
            let api_key = get("OPENAI_API_KEY").ok_or(ConfigError::Missing {
                provider: "openai",
                field: "OPENAI_API_KEY",
            })?;
            let model = get("OPENAI_MODEL").ok_or(ConfigError::Missing {
                provider: "openai",
                field: "OPENAI_MODEL",
            })?;
            Ok(LlmSettings::OpenAi {
                base_url: get("OPENAI_URL").unwrap_or_else(|| "https://api.openai.com/v1".into()),
                api_key: Some(api_key),
                model,
            })
        }
        "anthropic" => {
            let api_key = get("ANTHROPIC_API_KEY").ok_or(ConfigError::Missing {
                provider: "anthropic",
                field: "ANTHROPIC_API_KEY",
            })?;
            let model = get("ANTHROPIC_MODEL").ok_or(ConfigError::Missing {
                provider: "anthropic",
                field: "ANTHROPIC_MODEL",
            })?;
            Ok(LlmSettings::Anthropic {
                base_url: get("ANTHROPIC_URL")
                    .unwrap_or_else(|| "https://api.anthropic.com".into()),
                api_key,
                model,
            })
        }
        "ollama" => {
            let url = get("OLLAMA_URL").ok_or(ConfigError::Missing {
                provider: "ollama",
                field: "OLLAMA_URL",
            })?;
            let model = get("OLLAMA_MODEL").ok_or(ConfigError::Missing {
                provider: "ollama",
                field: "OLLAMA_MODEL",
            })?;
            Ok(LlmSettings::OpenAi {
                base_url: format!("{}/v1", url.trim_end_matches('/')),
                api_key: None,
                model,
            })
        }
        other => Err(ConfigError::UnknownProvider(other.to_string())),
    }
}

fn parse_positive(value: Option<String>) -> Option<f64> {
    value
        .and_then(|v| v.parse::<f64>().ok())
        .filter(|v| v.is_finite() && *v > 0.0)
}

fn parse_count(value: Option<String>) -> Option<usize> {
    value
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
}

pub fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
