/// Questions that need real computation. Checked before the lookup terms, so a
/// question mentioning both ("compare the latest closes") is not a lookup.
pub const COMPUTATION_TERMS: &[&str] = &[
    "计算",
    "回测",
    "策略",
    "指标",
    "均线",
    "MA",
    "RSI",
    "MACD",
    "KDJ",
    "波动",
    "相关",
    "回归",
    "对比",
    "比较",
    "预测",
    "因子",
    "分位",
    "统计",
    "收益率",
    "涨幅",
    "跌幅",
    "年化",
    "最大回撤",
    "calculate",
    "compute",
    "backtest",
    "strategy",
    "indicator",
    "moving average",
    "volatility",
    "correlation",
    "regression",
    "compare",
    "forecast",
    "predict",
    "percentile",
    "statistic",
    "annualized",
    "drawdown",
];

/// Questions answerable with one data lookup.
pub const LOOKUP_TERMS: &[&str] = &[
    "最近",
    "最新",
    "股价",
    "收盘",
    "开盘",
    "最高",
    "最低",
    "成交量",
    "涨跌幅",
    "估值",
    "PE",
    "PB",
    "市值",
    "换手",
    "公司信息",
    "公司简介",
    "主营",
    "所属行业",
    "列出",
    "有哪些",
    "latest",
    "stock price",
    "closing price",
    "opening price",
    "volume",
    "valuation",
    "market cap",
    "turnover",
    "company profile",
    "main business",
    "which industry",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryClass {
    NeedsComputation,
    SimpleLookup,
    Unclassified,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifierRule {
    pub class: QueryClass,
    pub terms: Vec<String>,
}

/// Ordered term rules; the first rule with a matching term decides the class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryPolicy {
    rules: Vec<ClassifierRule>,
}

impl Default for QueryPolicy {
    fn default() -> Self {
        Self::from_terms(owned(COMPUTATION_TERMS), owned(LOOKUP_TERMS))
    }
}

impl QueryPolicy {
    pub fn new(rules: Vec<ClassifierRule>) -> Self {
        Self { rules }
    }

    pub fn from_terms(computation_terms: Vec<String>, lookup_terms: Vec<String>) -> Self {
        Self::new(vec![
            ClassifierRule {
                class: QueryClass::NeedsComputation,
                terms: computation_terms,
            },
            ClassifierRule {
                class: QueryClass::SimpleLookup,
                terms: lookup_terms,
            },
        ])
    }

    pub fn classify(&self, question: &str) -> QueryClass {
        let question = question.trim();
        if question.is_empty() {
            return QueryClass::Unclassified;
        }

        let folded = question.to_lowercase();
        self.rules
            .iter()
            .find(|rule| {
                rule.terms
                    .iter()
                    .any(|term| term_matches(question, &folded, term))
            })
            .map_or(QueryClass::Unclassified, |rule| rule.class)
    }

    pub fn is_simple_lookup(&self, question: &str) -> bool {
        self.classify(question) == QueryClass::SimpleLookup
    }

    pub fn computation_terms(&self) -> Vec<String> {
        self.terms_for(QueryClass::NeedsComputation)
    }

    pub fn lookup_terms(&self) -> Vec<String> {
        self.terms_for(QueryClass::SimpleLookup)
    }

    fn terms_for(&self, class: QueryClass) -> Vec<String> {
        self.rules
            .iter()
            .filter(|rule| rule.class == class)
            .flat_map(|rule| rule.terms.iter().cloned())
            .collect()
    }
}

// Abbreviations like MA or PE only match in capitals; "ma" occurs inside
// too many ordinary words.
fn term_matches(question: &str, folded: &str, term: &str) -> bool {
    if term.chars().any(|ch| ch.is_ascii_uppercase()) {
        question.contains(term)
    } else {
        folded.contains(term)
    }
}

fn owned(terms: &[&str]) -> Vec<String> {
    terms.iter().map(|term| (*term).to_string()).collect()
}
