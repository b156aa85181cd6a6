use std::sync::Arc;

use serde_json::{Map, Value, json};

use crate::llm::provider::FunctionDeclaration;
use crate::sandbox::{Sandbox, StoreCallError};

use super::dispatch::{error_envelope, ok_envelope};

/// Row budget for tools that page through daily tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Paging {
    pub default_recent: usize,
    pub default_range: usize,
    pub max: usize,
}

impl Paging {
    /// An explicit limit is clamped; without one a date range gets the
    /// larger page.
    pub fn effective_limit(&self, requested: Option<i64>, has_range: bool) -> usize {
        let limit = match requested {
            Some(limit) if limit > 0 => usize::try_from(limit).unwrap_or(self.max),
            Some(_) => self.default_recent,
            None if has_range => self.default_range,
            None => self.default_recent,
        };
        limit.min(self.max)
    }
}

const DAILY_PAGING: Paging = Paging {
    default_recent: 10,
    default_range: 200,
    max: 200,
};

/// A plain-lookup tool backed by one data handle method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LookupTool {
    pub name: &'static str,
    pub method: &'static str,
    pub description: &'static str,
    pub required: &'static [&'static str],
    pub optional: &'static [&'static str],
    pub paging: Option<Paging>,
}

pub const LOOKUP_TOOLS: &[LookupTool] = &[
    LookupTool {
        name: "get_daily_prices",
        method: "daily",
        description: "Daily OHLCV rows for one stock, oldest first. Use for plain price questions such as the latest close; use execute_python for indicators or comparisons.",
        required: &["ts_code"],
        optional: &["start_date", "end_date"],
        paging: Some(DAILY_PAGING),
    },
    LookupTool {
        name: "get_daily_basic",
        method: "daily_basic",
        description: "Daily valuation rows (pe, pb, turnover, total_mv, circ_mv) for one stock, oldest first.",
        required: &["ts_code"],
        optional: &["start_date", "end_date"],
        paging: Some(DAILY_PAGING),
    },
    LookupTool {
        name: "get_stock_basic",
        method: "stock_basic",
        description: "Listing profile for one stock: name, industry, market, list_date.",
        required: &["ts_code"],
        optional: &[],
        paging: None,
    },
    LookupTool {
        name: "get_stock_company",
        method: "stock_company",
        description: "Company profile for one stock: chairman, registered capital, main business.",
        required: &["ts_code"],
        optional: &[],
        paging: None,
    },
    LookupTool {
        name: "get_trading_days",
        method: "trading_days",
        description: "Exchange trading days between two dates (YYYYMMDD, inclusive).",
        required: &["start_date", "end_date"],
        optional: &[],
        paging: None,
    },
];

pub fn find(name: &str) -> Option<&'static LookupTool> {
    LOOKUP_TOOLS.iter().find(|tool| tool.name == name)
}

impl LookupTool {
    pub fn declaration(&self) -> FunctionDeclaration {
        let mut properties = Map::new();
        for arg in self.required.iter().chain(self.optional) {
            properties.insert((*arg).to_string(), argument_schema(arg));
        }
        if self.paging.is_some() {
            properties.insert(
                "limit".to_string(),
                json!({"type": "integer", "description": "Maximum rows, counted back from the most recent"}),
            );
        }

        FunctionDeclaration {
            name: self.name.to_string(),
            description: self.description.to_string(),
            parameters_json_schema: json!({
                "type": "object",
                "properties": properties,
                "required": self.required,
            }),
        }
    }

    pub async fn run(&self, sandbox: Arc<Sandbox>, args: &Value) -> Value {
        let kwargs = match self.kwargs(args) {
            Ok(kwargs) => kwargs,
            Err(message) => {
                return error_envelope("invalid_args", message, json!({ "args": args }));
            }
        };
        let tail = self.paging.map(|paging| {
            let has_range = kwargs
                .iter()
                .any(|(key, _)| *key == "start_date" || *key == "end_date");
            paging.effective_limit(args.get("limit").and_then(Value::as_i64), has_range)
        });

        let method = self.method;
        let result =
            tokio::task::spawn_blocking(move || sandbox.call_store(method, &kwargs, tail)).await;

        match result {
            Ok(Ok(rows)) => {
                let count = rows.as_array().map(Vec::len);
                ok_envelope(json!({ "rows": rows, "count": count }))
            }
            Ok(Err(err)) => store_error(err),
            Err(err) => error_envelope(
                "internal",
                format!("lookup task failed: {err}"),
                json!({}),
            ),
        }
    }

    fn kwargs(&self, args: &Value) -> Result<Vec<(&'static str, String)>, String> {
        let mut kwargs = Vec::new();
        for key in self.required {
            match string_arg(args, key) {
                Some(value) => kwargs.push((*key, value)),
                None => return Err(format!("{} requires a non-empty `{key}`", self.name)),
            }
        }
        for key in self.optional {
            if let Some(value) = string_arg(args, key) {
                kwargs.push((*key, value));
            }
        }
        Ok(kwargs)
    }
}

fn argument_schema(arg: &str) -> Value {
    match arg {
        "ts_code" => json!({"type": "string", "description": "Stock code such as 600519.SH"}),
        _ => json!({"type": "string", "description": "Date as YYYYMMDD"}),
    }
}

fn string_arg(args: &Value, key: &str) -> Option<String> {
    match args.get(key)? {
        Value::String(text) if !text.trim().is_empty() => Some(text.trim().to_string()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

fn store_error(err: StoreCallError) -> Value {
    match &err {
        StoreCallError::Unconfigured => error_envelope("store_unavailable", err.to_string(), json!({})),
        StoreCallError::Python { exc_type, message } => error_envelope(
            "python_exception",
            err.to_string(),
            json!({ "exc_type": exc_type, "message": message }),
        ),
        StoreCallError::Decode(_) => error_envelope("internal", err.to_string(), json!({})),
    }
}
