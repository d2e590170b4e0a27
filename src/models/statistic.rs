use std::fmt;

/// Aggregation applied to a metric over the lookback window.
///
/// Performance Insights accepts the statistic as a `.`-separated suffix on
/// the metric name, e.g. `os.cpuUtilization.user.avg`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Statistic {
    Avg,
    Min,
    Max,
    Sum,
}

impl Statistic {
    pub const ALL: [Self; 4] = [Self::Avg, Self::Min, Self::Max, Self::Sum];

    /// Parse a raw statistic string. Unknown values fail closed.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "avg" => Some(Self::Avg),
            "min" => Some(Self::Min),
            "max" => Some(Self::Max),
            "sum" => Some(Self::Sum),
            _ => None,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Avg => "avg",
            Self::Min => "min",
            Self::Max => "max",
            Self::Sum => "sum",
        }
    }
}

impl fmt::Display for Statistic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_valid_statistics() {
        assert_eq!(Statistic::parse("avg"), Some(Statistic::Avg));
        assert_eq!(Statistic::parse("min"), Some(Statistic::Min));
        assert_eq!(Statistic::parse("max"), Some(Statistic::Max));
        assert_eq!(Statistic::parse("sum"), Some(Statistic::Sum));
    }

    #[test]
    fn test_parse_rejects_unknown() {
        assert_eq!(Statistic::parse("p99"), None);
        assert_eq!(Statistic::parse("AVG"), None);
        assert_eq!(Statistic::parse(""), None);
        assert_eq!(Statistic::parse("average"), None);
    }

    #[test]
    fn test_string_round_trip() {
        for statistic in Statistic::ALL {
            assert_eq!(Statistic::parse(statistic.as_str()), Some(statistic));
        }
    }
}
