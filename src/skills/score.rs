use super::SkillSummary;

const DIRECT_MATCH_SCORE: u32 = 10;
const TOKEN_MATCH_SCORE: u32 = 3;
const BOOST_MATCH_SCORE: u32 = 2;

/// Query keyword to the haystack words it vouches for.
const KEYWORD_BOOSTS: &[(&str, &[&str])] = &[
    ("回测", &["backtest", "回测", "equity", "drawdown", "sharpe", "cagr", "strategy", "策略"]),
    ("策略", &["strategy", "策略", "signal", "signals", "entries", "exits"]),
    ("双均线", &["ma", "均线", "crossover", "cross", "golden", "death"]),
    ("金叉", &["golden", "cross", "crossover", "金叉", "均线"]),
    ("死叉", &["death", "cross", "crossover", "死叉", "均线"]),
    ("均线", &["ma", "ma5", "ma20", "ma60", "rolling", "均线"]),
    ("MA", &["ma", "rolling"]),
    ("RSI", &["rsi"]),
    ("波动", &["std", "volatility", "波动"]),
    ("波动率", &["vol", "volatility", "波动率", "risk"]),
    ("风险", &["risk", "drawdown", "volatility", "风险", "回撤"]),
    ("回撤", &["drawdown", "mdd", "回撤"]),
    ("收益", &["returns", "ret", "pct_change", "收益", "涨跌幅", "复权"]),
    ("收益率", &["returns", "ret", "pct_change", "收益率"]),
    ("涨跌幅", &["pct_chg", "pct_change", "涨跌幅", "收益"]),
    ("动量", &["momentum", "mom", "动量", "breakout", "新高"]),
    ("突破", &["breakout", "donchian", "突破", "新高"]),
    ("新高", &["high52", "52w", "high", "新高", "breakout"]),
    ("复权", &["adj", "qfq", "hfq", "复权", "returns"]),
    ("相关", &["corr", "correlation", "相关", "compare"]),
    ("相关性", &["corr", "correlation", "相关性"]),
    ("对比", &["compare", "multi", "对比", "比较"]),
    ("比较", &["compare", "multi", "比较"]),
    ("合并", &["merge", "join", "合并"]),
    ("join", &["join", "merge"]),
    ("merge", &["merge", "join"]),
    ("市值", &["mv", "市值", "total_mv", "circ_mv", "亿元"]),
    ("换手", &["turnover", "换手"]),
    ("最近", &["sort", "descending", "tail", "head", "最近"]),
    ("trade_date", &["trade_date", "日期"]),
    ("日期", &["trade_date", "日期", "to_datetime"]),
];

pub fn score(query: &str, skill: &SkillSummary) -> u32 {
    let query = query.trim();
    if query.is_empty() {
        return 0;
    }

    let tags = skill.tags.join(" ");
    let haystack = [
        skill.name.as_str(),
        skill.description.as_deref().unwrap_or_default(),
        tags.as_str(),
        skill.skill_id.as_str(),
    ]
    .join(" ");
    let haystack_lower = haystack.to_lowercase();

    let mut score = 0;
    for needle in [skill.name.as_str(), skill.skill_id.as_str()] {
        if !needle.is_empty() && query.contains(needle) {
            score += DIRECT_MATCH_SCORE;
        }
    }

    score += query
        .split(|ch: char| ch.is_whitespace() || ch == ',' || ch == '，')
        .filter(|token| !token.is_empty() && haystack.contains(token))
        .count() as u32
        * TOKEN_MATCH_SCORE;

    for (keyword, boosts) in KEYWORD_BOOSTS {
        if query.contains(keyword) {
            score += boosts
                .iter()
                .filter(|boost| haystack_lower.contains(&boost.to_lowercase()))
                .count() as u32
                * BOOST_MATCH_SCORE;
        }
    }

    score
}
