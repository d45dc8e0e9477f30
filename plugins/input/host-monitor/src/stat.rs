/// Kernel tick rate. Fixed at the usual USER_HZ; the kernel ABI has kept
/// this value for all supported architectures.
pub const CLK_TCK: u64 = 100;

/// Parsed subset of `/proc/<pid>/stat`.
/// See https://man7.org/linux/man-pages/man5/proc.5.html for field order.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessStat {
    pub pid: i32,
    pub comm: String,
    pub state: char,
    pub ppid: i32,
    pub minor_faults: u64,
    pub major_faults: u64,
    pub utime_ticks: u64,
    pub stime_ticks: u64,
    pub priority: i64,
    pub nice: i64,
    pub num_threads: i64,
    pub start_ticks: u64,
    pub vsize: u64,
    pub rss: u64,
    pub processor: i32,
}

// Overall field indices per proc(5); `comm` is field 1, `processor` is
// field 38 and must be present.
const FIELD_STATE: usize = 2;
const FIELD_PPID: usize = 3;
const FIELD_MINFLT: usize = 9;
const FIELD_MAJFLT: usize = 11;
const FIELD_UTIME: usize = 13;
const FIELD_STIME: usize = 14;
const FIELD_PRIORITY: usize = 17;
const FIELD_NICE: usize = 18;
const FIELD_NUM_THREADS: usize = 19;
const FIELD_STARTTIME: usize = 21;
const FIELD_VSIZE: usize = 22;
const FIELD_RSS: usize = 23;
const FIELD_PROCESSOR: usize = 38;

/// Parse one `/proc/<pid>/stat` line.
///
/// The `comm` field is enclosed in parentheses and may itself contain
/// spaces and parentheses, so it is delimited by the *last* `)` on the
/// line. Lines shorter than the `processor` field are rejected.
pub fn parse_stat_line(pid: i32, line: &str) -> Option<ProcessStat> {
    let open = line.find('(')?;
    let close = line.rfind(')')?;
    if close < open {
        return None;
    }
    let comm = &line[open + 1..close];
    let rest = line.get(close + 1..)?.trim_start();
    let fields: Vec<&str> = rest.split_ascii_whitespace().collect();
    // `fields[0]` is overall field 2 (state).
    let field = |i: usize| fields.get(i - FIELD_STATE).copied();
    if field(FIELD_PROCESSOR).is_none() {
        return None;
    }

    Some(ProcessStat {
        pid,
        comm: comm.to_string(),
        state: field(FIELD_STATE)?.chars().next()?,
        ppid: field(FIELD_PPID)?.parse().ok()?,
        minor_faults: field(FIELD_MINFLT)?.parse().ok()?,
        major_faults: field(FIELD_MAJFLT)?.parse().ok()?,
        utime_ticks: field(FIELD_UTIME)?.parse().ok()?,
        stime_ticks: field(FIELD_STIME)?.parse().ok()?,
        priority: field(FIELD_PRIORITY)?.parse().ok()?,
        nice: field(FIELD_NICE)?.parse().ok()?,
        num_threads: field(FIELD_NUM_THREADS)?.parse().ok()?,
        start_ticks: field(FIELD_STARTTIME)?.parse().ok()?,
        vsize: field(FIELD_VSIZE)?.parse().ok()?,
        rss: field(FIELD_RSS)?.parse().ok()?,
        processor: field(FIELD_PROCESSOR)?.parse().ok()?,
    })
}

/// Read the host boot time (`btime` line) from `/proc/stat` contents.
pub fn parse_boot_time(stat: &str) -> Option<i64> {
    for line in stat.lines() {
        if let Some(rest) = line.strip_prefix("btime ") {
            return rest.trim().parse().ok();
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line_with_comm(comm: &str) -> String {
        let tail: Vec<String> = (2..=41).map(|i| i.to_string()).collect();
        format!("42 ({comm}) S {}", tail[1..].join(" "))
    }

    #[test]
    fn parses_plain_comm() {
        let stat = parse_stat_line(42, &line_with_comm("bash")).unwrap();
        assert_eq!(stat.pid, 42);
        assert_eq!(stat.comm, "bash");
        assert_eq!(stat.state, 'S');
        assert_eq!(stat.ppid, 3);
    }

    #[test]
    fn tolerates_spaces_and_parens_in_comm() {
        let stat = parse_stat_line(42, &line_with_comm("tmux: server")).unwrap();
        assert_eq!(stat.comm, "tmux: server");

        let stat = parse_stat_line(42, &line_with_comm("fun (name)")).unwrap();
        assert_eq!(stat.comm, "fun (name)");
        assert_eq!(stat.state, 'S');
    }

    #[test]
    fn field_offsets_match_proc5() {
        // Fields after comm carry their own index, so each parsed value
        // pins its field position.
        let stat = parse_stat_line(42, &line_with_comm("x")).unwrap();
        assert_eq!(stat.minor_faults, 9);
        assert_eq!(stat.utime_ticks, 13);
        assert_eq!(stat.stime_ticks, 14);
        assert_eq!(stat.num_threads, 19);
        assert_eq!(stat.start_ticks, 21);
        assert_eq!(stat.vsize, 22);
        assert_eq!(stat.rss, 23);
        assert_eq!(stat.processor, 38);
    }

    #[test]
    fn short_line_is_rejected() {
        // Only 20 fields after comm: processor (field 38) is missing.
        let short = format!("42 (x) S {}", (3..=20).map(|i| i.to_string()).collect::<Vec<_>>().join(" "));
        assert!(parse_stat_line(42, &short).is_none());
    }

    #[test]
    fn boot_time_from_proc_stat() {
        let raw = "cpu  214 0 180 9 0 0 0 0 0 0\ncpu0 100 0 90 4 0 0 0 0 0 0\nbtime 1700000000\nprocesses 12345\n";
        assert_eq!(parse_boot_time(raw), Some(1700000000));
        assert_eq!(parse_boot_time("no btime here"), None);
    }
}
