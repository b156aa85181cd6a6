//! Deterministic hints appended to sandbox failures.
//!
//! Rules are matched against the full error text in table order and each
//! matching rule contributes one bullet. The original text is always kept as
//! a prefix of the enriched text.

#[derive(Debug, Clone, Copy)]
enum Signature {
    Any(&'static [&'static str]),
    All(&'static [&'static str]),
}

impl Signature {
    fn matches(self, error: &str) -> bool {
        match self {
            Self::Any(needles) => needles.iter().any(|needle| error.contains(needle)),
            Self::All(needles) => needles.iter().all(|needle| error.contains(needle)),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct HintRule {
    signature: Signature,
    hint: &'static str,
}

const HINT_RULES: &[HintRule] = &[
    HintRule {
        signature: Signature::Any(&["unexpected keyword argument 'offset'"]),
        hint: "store methods do not take `offset`; load the frame once and slice it with `df.iloc[start:end]` or `df.tail(n)`.",
    },
    HintRule {
        signature: Signature::Any(&["unexpected keyword argument 'limit'"]),
        hint: "this store method does not take `limit`; call it without one and trim the result with `df.head(n)` or `df.tail(n)`.",
    },
    HintRule {
        signature: Signature::All(&["Referenced column", "not found"]),
        hint: "the query filtered on a column the table does not have; check `df.columns` first (calendar tables have no `ts_code`).",
    },
    HintRule {
        signature: Signature::Any(&["BinderException", "Binder Error"]),
        hint: "the store rejected a column or table name; list the available fields before filtering on them.",
    },
    HintRule {
        signature: Signature::Any(&[
            "not supported between instances of 'str' and 'int'",
            "not supported between instances of 'int' and 'str'",
            "Invalid comparison between",
        ]),
        hint: "date columns from `store` are numeric YYYYMMDD values; compare them with ints like 20240102, not strings.",
    },
    HintRule {
        signature: Signature::Any(&["ModuleNotFoundError", "No module named"]),
        hint: "only the preloaded libraries are available; use `pd`, `np` and `store` (and `plt` when plotting is enabled).",
    },
    HintRule {
        signature: Signature::Any(&[
            "UnboundLocalError",
            "referenced before assignment",
            "is not defined",
        ]),
        hint: "a name was used before it was assigned; variables only persist within one session and are lost when it is cleared.",
    },
];

/// Appends a `Hints:` section for every recognised failure signature.
pub fn enrich_error(error: &str) -> String {
    let hints = HINT_RULES
        .iter()
        .filter(|rule| rule.signature.matches(error))
        .map(|rule| rule.hint)
        .collect::<Vec<_>>();
    if hints.is_empty() {
        return error.to_string();
    }

    let mut enriched = String::with_capacity(error.len() + 128 * hints.len());
    enriched.push_str(error);
    if !enriched.ends_with('\n') {
        enriched.push('\n');
    }
    enriched.push_str("\nHints:");
    for hint in hints {
        enriched.push_str("\n- ");
        enriched.push_str(hint);
    }
    enriched
}

#[cfg(test)]
mod tests {
    use super::enrich_error;

    #[test]
    fn unknown_errors_pass_through_unchanged() {
        let error = "ZeroDivisionError: division by zero\n";
        assert_eq!(enrich_error(error), error);
    }

    #[test]
    fn offset_keyword_gets_slicing_hint() {
        let error =
            "TypeError: daily() got an unexpected keyword argument 'offset'\nTraceback ...";
        let enriched = enrich_error(error);

        assert!(enriched.starts_with(error));
        assert!(enriched.contains("Hints:"));
        assert!(enriched.contains("offset"));
        assert!(enriched.contains("df.iloc"));
    }

    #[test]
    fn missing_column_hint_mentions_ts_code() {
        let error = "BinderException: Referenced column \"ts_code\" not found in FROM clause";
        let enriched = enrich_error(error);

        assert!(enriched.contains("Hints:"));
        assert!(enriched.contains("ts_code"));
        assert_eq!(enriched.matches("\n- ").count(), 2);
    }

    #[test]
    fn enrichment_is_deterministic() {
        let error = "TypeError: '>' not supported between instances of 'str' and 'int'";
        assert_eq!(enrich_error(error), enrich_error(error));
        insta::assert_snapshot!(enrich_error(error), @r"
        TypeError: '>' not supported between instances of 'str' and 'int'

        Hints:
        - date columns from `store` are numeric YYYYMMDD values; compare them with ints like 20240102, not strings.
        ");
    }

    #[test]
    fn name_errors_after_reset_get_persistence_hint() {
        let enriched = enrich_error("NameError: name 'x' is not defined");
        assert!(enriched.contains("persist"));
    }
}
