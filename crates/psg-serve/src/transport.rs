use anyhow::{anyhow, Result};
use log::{error, info};
use psg_lib::error::{ErrorKind, ErrorReport};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::{self, BufRead, Write};

use crate::tools::ToolRegistry;

pub fn run(registry: &ToolRegistry, transport: &str) -> Result<()> {
    match transport {
        "stdio" => {
            let stdin = io::stdin();
            let stdout = io::stdout();
            info!("Listening for tool requests on stdin/stdout");
            serve_lines(registry, stdin.lock(), stdout.lock())
        }
        other => Err(anyhow!("unsupported transport '{}'", other)),
    }
}

/// Answer one JSON request per input line until EOF.
pub fn serve_lines<R: BufRead, W: Write>(
    registry: &ToolRegistry,
    mut reader: R,
    mut writer: W,
) -> Result<()> {
    loop {
        let mut line = String::new();
        let bytes = reader.read_line(&mut line)?;
        if bytes == 0 {
            info!("EOF reached, stopping transport");
            break;
        }

        if line.trim().is_empty() {
            continue;
        }

        let request: ToolRequest = match serde_json::from_str(&line) {
            Ok(req) => req,
            Err(err) => {
                error!("failed to parse request: {}", err);
                let report = ErrorReport {
                    kind: ErrorKind::InvalidArgument,
                    message: format!("malformed request: {}", err),
                    detail: None,
                };
                write_response(&mut writer, &ToolResponse::error(None, report))?;
                continue;
            }
        };

        let response = match registry.execute(&request.method, request.params) {
            Ok(result) => ToolResponse::ok(request.id, result),
            Err(err) => {
                error!("tool '{}' failed: {:#}", request.method, err);
                ToolResponse::error(request.id, ErrorReport::from_anyhow(&err))
            }
        };

        write_response(&mut writer, &response)?;
    }

    Ok(())
}

fn write_response(writer: &mut dyn Write, response: &ToolResponse) -> Result<()> {
    let serialized = serde_json::to_string(response)?;
    writer.write_all(serialized.as_bytes())?;
    writer.write_all(b"\n")?;
    writer.flush()?;
    Ok(())
}

#[derive(Debug, Deserialize)]
struct ToolRequest {
    #[serde(default)]
    id: Option<Value>,
    method: String,
    #[serde(default)]
    params: Option<Value>,
}

#[derive(Debug, Serialize)]
struct ToolResponse {
    id: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ErrorReport>,
}

impl ToolResponse {
    fn ok(id: Option<Value>, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    fn error(id: Option<Value>, report: ErrorReport) -> Self {
        Self {
            id,
            result: None,
            error: Some(report),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use psg_lib::config::PsgConfig;

    fn exchange(input: &str) -> Vec<Value> {
        let registry = ToolRegistry::new(PsgConfig::default());
        let mut out = Vec::new();
        serve_lines(&registry, input.as_bytes(), &mut out).unwrap();
        String::from_utf8(out)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[test]
    fn answers_each_line_in_order() {
        let responses = exchange(
            "{\"id\": 1, \"method\": \"list_tools\"}\n\n{\"id\": \"b\", \"method\": \"get_chunk\", \"params\": {}}\n",
        );
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0]["id"], 1);
        assert!(responses[0]["result"]
            .as_array()
            .unwrap()
            .iter()
            .any(|t| t == "run_ahi_analysis"));
        assert_eq!(responses[1]["id"], "b");
        assert_eq!(responses[1]["error"]["kind"], "invalid_argument");
        assert!(responses[1].get("result").is_none());
    }

    #[test]
    fn malformed_line_gets_an_error_and_serving_continues() {
        let responses = exchange("not json\n{\"id\": 2, \"method\": \"list_tools\"}\n");
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0]["id"], Value::Null);
        assert_eq!(responses[0]["error"]["kind"], "invalid_argument");
        assert_eq!(responses[1]["id"], 2);
    }

    #[test]
    fn missing_recording_is_file_unavailable() {
        let responses = exchange(
            "{\"id\": 3, \"method\": \"get_info\", \"params\": {\"path\": \"/nonexistent/rec.edf\"}}\n",
        );
        assert_eq!(responses[0]["error"]["kind"], "file_unavailable");
    }
}
