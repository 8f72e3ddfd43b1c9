//! Verifier log levels and statistics

use {
    combine::{
        many, many1,
        parser::char::{digit, spaces, string},
        satisfy, token, Parser,
    },
    serde::{Deserialize, Serialize},
};

/// Smallest log buffer the kernel accepts
pub const MIN_LOG_SIZE: u32 = 128;

/// Largest log buffer the kernel accepts since Linux 5.2, (2^30) - 1
pub const MAX_LOG_SIZE: u32 = (1 << 30) - 1;

/// Default log buffer size, (2^22) - 1
///
/// Large enough for the logs of most programs, and within the maximum of
/// (2^24) - 1 accepted by kernels before 5.2.
pub const DEFAULT_LOG_SIZE: u32 = (1 << 22) - 1;

/// How much text the verifier writes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    /// No log
    #[default]
    Off,
    /// Branch level information, on rejection only
    Branch,
    /// Register state after every instruction
    Instruction,
    /// Summary statistics only
    Stats,
}

impl LogLevel {
    /// The `log_level` attribute passed to the kernel
    pub fn as_raw(self) -> u32 {
        match self {
            LogLevel::Off => 0,
            LogLevel::Branch => 1,
            LogLevel::Instruction => 2,
            LogLevel::Stats => 4,
        }
    }
}

/// Summary printed by the verifier after analysing a program
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VerifierStats {
    /// Number of instructions processed, counting revisits
    pub processed: u64,
    /// Complexity limit of the kernel
    pub limit: u64,
    /// The remaining counters, e.g. `total_states` and `peak_states`
    pub counters: Vec<(String, u64)>,
}

impl VerifierStats {
    /// Value of a named counter
    pub fn counter(&self, name: &str) -> Option<u64> {
        self.counters
            .iter()
            .find(|(counter, _)| counter == name)
            .map(|(_, value)| *value)
    }
}

/// Finds and parses the statistics line of a verifier log
///
/// The line looks like `processed 3 insns (limit 1000000) max_states_per_insn 0
/// total_states 0 peak_states 0 mark_read 0`.
pub fn parse_stats(log: &str) -> Option<VerifierStats> {
    log.lines().rev().find_map(parse_stats_line)
}

fn parse_stats_line(line: &str) -> Option<VerifierStats> {
    let number = || {
        many1::<String, _>(digit()).map(|digits| digits.parse::<u64>().unwrap_or(u64::MAX))
    };
    let counter = (
        many1::<String, _>(satisfy(|c: char| c.is_ascii_lowercase() || c == '_')).skip(spaces()),
        number().skip(spaces()),
    );
    let mut line_parser = (
        string("processed").skip(spaces()),
        number().skip(spaces()),
        string("insns").skip(spaces()),
        string("(limit").skip(spaces()),
        number(),
        token(')').skip(spaces()),
        many::<Vec<(String, u64)>, _>(counter),
    )
        .map(|(_, processed, _, _, limit, _, counters)| VerifierStats {
            processed,
            limit,
            counters,
        });
    line_parser
        .parse(line.trim())
        .ok()
        .map(|(stats, _rest)| stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_stats() {
        let log = "0: (bf) r0 = r1\n\
                   1: (95) exit\n\
                   processed 2 insns (limit 1000000) max_states_per_insn 0 total_states 0 peak_states 0 mark_read 0\n";
        let stats = parse_stats(log).unwrap();
        assert_eq!(stats.processed, 2);
        assert_eq!(stats.limit, 1_000_000);
        assert_eq!(stats.counter("total_states"), Some(0));
        assert_eq!(stats.counter("max_states_per_insn"), Some(0));
        assert_eq!(stats.counter("unknown"), None);
    }

    #[test]
    fn test_parse_stats_without_counters() {
        let stats = parse_stats("processed 17 insns (limit 131072)").unwrap();
        assert_eq!(stats.processed, 17);
        assert_eq!(stats.limit, 131_072);
        assert!(stats.counters.is_empty());
    }

    #[test]
    fn test_parse_stats_missing() {
        assert_eq!(parse_stats(""), None);
        assert_eq!(parse_stats("0: (95) exit\nR0 !read_ok\n"), None);
    }

    #[test]
    fn test_log_level_raw() {
        assert_eq!(LogLevel::Off.as_raw(), 0);
        assert_eq!(LogLevel::Instruction.as_raw(), 2);
        assert_eq!(LogLevel::Stats.as_raw(), 4);
    }
}
