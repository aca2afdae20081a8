use clap::{Arg, ArgAction, Command};
use muxping::config::DEFAULT_QUEUE_CAPACITY;
use muxping::icmp::DEFAULT_PAYLOAD_SIZE;

#[derive(Debug, Clone)]
pub struct PingArgs {
    pub targets: Vec<String>,
    pub count: Option<u32>,
    pub interval: Option<u32>,
    pub timeout: Option<u32>,
    pub size: Option<u32>,
    pub force_ipv4: bool,
    pub force_ipv6: bool,
    pub workers: i32,
    pub queue: usize,
    pub evict: bool,
}

impl Default for PingArgs {
    fn default() -> Self {
        Self {
            targets: Vec::new(),
            count: Some(4),
            interval: Some(1000),
            timeout: Some(4000),
            size: Some(DEFAULT_PAYLOAD_SIZE as u32),
            force_ipv4: false,
            force_ipv6: false,
            workers: -1,
            queue: DEFAULT_QUEUE_CAPACITY,
            evict: false,
        }
    }
}

pub fn build_cli() -> Command {
    Command::new("muxping")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Ping many hosts at once over shared raw ICMP sockets")
        .arg(
            Arg::new("targets")
                .help("Target hostnames or IP addresses")
                .required(true)
                .num_args(1..)
                .index(1),
        )
        .arg(
            Arg::new("count")
                .short('n')
                .help("Number of echo requests to send to each target")
                .value_name("count")
                .value_parser(clap::value_parser!(u32)),
        )
        .arg(
            Arg::new("interval")
                .short('i')
                .help("Milliseconds between echo requests")
                .value_name("interval")
                .value_parser(clap::value_parser!(u32)),
        )
        .arg(
            Arg::new("timeout")
                .short('w')
                .help("Timeout in milliseconds to wait for each reply")
                .value_name("timeout")
                .value_parser(clap::value_parser!(u32)),
        )
        .arg(
            Arg::new("size")
                .short('l')
                .help("Echo payload size in bytes")
                .value_name("size")
                .value_parser(clap::value_parser!(u32)),
        )
        .arg(
            Arg::new("force_ipv4")
                .short('4')
                .help("Force using IPv4")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("force_ipv6")
                .short('6')
                .help("Force using IPv6")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("workers")
                .long("workers")
                .help("Reply workers: below -1 inline, -1 elastic, 0 one task per reply, N fixed")
                .value_name("workers")
                .allow_negative_numbers(true)
                .value_parser(clap::value_parser!(i32)),
        )
        .arg(
            Arg::new("queue")
                .long("queue")
                .help("Capacity of the reply worker queue")
                .value_name("queue")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("evict")
                .long("evict")
                .help("Evict the oldest outstanding probe when sequence numbers run out")
                .action(ArgAction::SetTrue),
        )
}

pub fn parse_args() -> anyhow::Result<PingArgs> {
    parse_from(std::env::args_os())
}

pub fn parse_from<I, T>(argv: I) -> anyhow::Result<PingArgs>
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    let matches = build_cli().try_get_matches_from(argv)?;

    let mut args = PingArgs::default();

    args.targets = matches
        .get_many::<String>("targets")
        .map(|targets| targets.cloned().collect())
        .unwrap_or_default();
    args.force_ipv4 = matches.get_flag("force_ipv4");
    args.force_ipv6 = matches.get_flag("force_ipv6");
    args.evict = matches.get_flag("evict");

    if let Some(count) = matches.get_one::<u32>("count") {
        args.count = Some(*count);
    }

    if let Some(interval) = matches.get_one::<u32>("interval") {
        args.interval = Some(*interval);
    }

    if let Some(timeout) = matches.get_one::<u32>("timeout") {
        args.timeout = Some(*timeout);
    }

    if let Some(size) = matches.get_one::<u32>("size") {
        args.size = Some(*size);
    }

    if let Some(workers) = matches.get_one::<i32>("workers") {
        args.workers = *workers;
    }

    if let Some(queue) = matches.get_one::<usize>("queue") {
        args.queue = *queue;
    }

    // Validation
    if args.force_ipv4 && args.force_ipv6 {
        return Err(anyhow::anyhow!("Cannot force both IPv4 and IPv6"));
    }

    Ok(args)
}
