use std::{fs, process::ExitCode};

use memhier::cache::Hierarchy;
use memhier::config::Config;
use memhier::trace::{Reference, Trace};

fn main() -> ExitCode {
    env_logger::init();

    let mut args = pico_args::Arguments::from_env();
    let heartbeat_int: u64 = args
        .opt_value_from_str("--heartbeat")
        .expect("--heartbeat should be an integer")
        .unwrap_or(0);

    let config_str: String = if let Some(config_str) = args.opt_value_from_str("--config").unwrap()
    {
        config_str
    } else {
        let config_path: String = args
            .opt_value_from_str("-p")
            .unwrap()
            .expect("Must provide a config with --config <json> or -p <path>");
        fs::read_to_string(config_path).expect("Could not find config file")
    };
    let config: Config = serde_json::from_str(&config_str).expect("Malformed config");
    let mut hierarchy = match Hierarchy::new(&config) {
        Ok(hierarchy) => hierarchy,
        Err(err) => {
            eprintln!("invalid configuration: {err}");
            return ExitCode::FAILURE;
        }
    };

    let stats_path: Option<String> = args.opt_value_from_str("--json").unwrap();

    let trace_path: String = args
        .opt_value_from_str("-t")
        .unwrap()
        .expect("Must provide a trace with -t");
    let refs_per_block: usize = args
        .opt_value_from_str("--buffer-size")
        .expect("--buffer-size must be an integer")
        .unwrap_or(1024 * 16);
    let blocks_per_queue: usize = args
        .opt_value_from_str("--queue-size")
        .expect("--queue-size must be an integer")
        .unwrap_or(32);

    let trace = Trace::open(trace_path.into(), refs_per_block, blocks_per_queue)
        .expect("Could not open trace file");

    let mut total_refs: u64 = 0;
    let mut total_cycles: u64 = 0;
    let mut next_heartbeat = heartbeat_int;
    for block in trace.rec.iter() {
        for reference in block {
            let latency = match reference {
                Reference::Fetch(addr) => hierarchy.access_instruction(addr),
                Reference::Load(addr) | Reference::Store(addr) => hierarchy.access_data(addr),
            };
            total_refs += 1;
            total_cycles += u64::from(latency);
        }
        if heartbeat_int != 0 && total_refs > next_heartbeat {
            println!("Refs: {total_refs}");
            while next_heartbeat < total_refs {
                next_heartbeat += heartbeat_int;
            }
        }
    }
    println!("Ran {total_refs} references");

    let reports = hierarchy.report();
    for report in &reports {
        println!(
            "{:<8} refs {:>10}  misses {:>10}  miss rate {:.4}  penalty {:>12}  avg access {:.2}",
            report.name,
            report.refs,
            report.misses,
            report.miss_rate,
            report.penalty_cycles,
            report.avg_access_time,
        );
    }
    if total_refs > 0 {
        println!(
            "Average reference latency: {:.2} cycles",
            total_cycles as f64 / total_refs as f64
        );
    }

    if let Some(path) = stats_path {
        let stats_file = fs::File::create(path).expect("Cannot open output file");
        serde_json::to_writer_pretty(stats_file, &reports).expect("Cannot write stats");
    }
    ExitCode::SUCCESS
}
