use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use colored::*;
use owbus::command::CommandResult;
use owbus::logger::LogEntry;
use owbus::{
    BusMaster, DeviceAddress, LogLevel, NotifyScope, SearchCriteria, SearchResult, SimBusConfig,
    SimulatedBus, Subscriber,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;
use tracing::{debug, Level};

const DEFAULT_SCRATCHPAD_LEN: &str = "9";

type CliResult = Result<(), Box<dyn std::error::Error>>;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Format {
    Table,
    Json,
}

struct Context {
    bus: Arc<BusMaster>,
    driver: Arc<SimulatedBus>,
    runtime: Runtime,
    format: Format,
    log: bool,
}

fn main() -> CliResult {
    let matches = App::new("owbus")
        .version("0.1.0")
        .about("1-Wire bus master over a simulated adapter")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("Simulated bus configuration (JSON)")
                .takes_value(true)
                .global(true),
        )
        .arg(
            Arg::with_name("format")
                .short("f")
                .long("format")
                .value_name("FORMAT")
                .help("Output format")
                .takes_value(true)
                .possible_values(&["table", "json"])
                .default_value("table")
                .global(true),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .long("verbose")
                .help("Enable debug logging")
                .global(true),
        )
        .arg(
            Arg::with_name("log")
                .short("l")
                .long("log")
                .help("Print the command log after each command")
                .global(true),
        )
        .subcommand(
            SubCommand::with_name("search")
                .about("Enumerate devices on the bus")
                .arg(
                    Arg::with_name("alarm")
                        .long("alarm")
                        .help("Only devices signaling an alarm")
                        .conflicts_with("family"),
                )
                .arg(
                    Arg::with_name("family")
                        .long("family")
                        .value_name("XX")
                        .help("Only devices of this family code (hex)")
                        .takes_value(true)
                        .validator(|v| {
                            parse_family(&v)
                                .map(|_| ())
                                .map_err(|_| "Family code must be one hex byte".into())
                        }),
                ),
        )
        .subcommand(
            SubCommand::with_name("watch")
                .about("Subscribe to search notifications and print changes")
                .arg(
                    Arg::with_name("period")
                        .long("period")
                        .value_name("MS")
                        .help("Minimum notification period in milliseconds")
                        .takes_value(true)
                        .required(true)
                        .validator(|v| match v.parse::<u64>() {
                            Ok(ms) if ms > 0 => Ok(()),
                            _ => Err("Period must be a positive number of milliseconds".into()),
                        }),
                )
                .arg(
                    Arg::with_name("alarm")
                        .long("alarm")
                        .help("Watch the alarm search instead of the general one"),
                )
                .arg(
                    Arg::with_name("duration")
                        .long("duration")
                        .value_name("S")
                        .help("Stop after this many seconds (default: until Ctrl-C)")
                        .takes_value(true)
                        .validator(|v| match v.parse::<u64>() {
                            Ok(_) => Ok(()),
                            Err(_) => Err("Duration must be a number of seconds".into()),
                        }),
                ),
        )
        .subcommand(
            SubCommand::with_name("convert")
                .about("Start a temperature conversion")
                .arg(address_arg().required(false).help("Target device (default: all devices)")),
        )
        .subcommand(
            SubCommand::with_name("power-supply")
                .about("Read whether a device is externally powered")
                .arg(address_arg()),
        )
        .subcommand(
            SubCommand::with_name("read-scratchpad")
                .about("Read a device scratchpad")
                .arg(address_arg())
                .arg(
                    Arg::with_name("len")
                        .long("len")
                        .value_name("N")
                        .help("Number of bytes to read")
                        .takes_value(true)
                        .default_value(DEFAULT_SCRATCHPAD_LEN)
                        .validator(|v| match v.parse::<usize>() {
                            Ok(_) => Ok(()),
                            Err(_) => Err("Length must be a number".into()),
                        }),
                ),
        )
        .subcommand(
            SubCommand::with_name("write-scratchpad")
                .about("Write bytes to a device scratchpad")
                .arg(address_arg())
                .arg(
                    Arg::with_name("data")
                        .value_name("HEX")
                        .help("Bytes to write, as hex")
                        .required(true)
                        .validator(|v| parse_hex(&v).map(|_| ())),
                ),
        )
        .subcommand(SubCommand::with_name("devices").about("List the configured devices"))
        .get_matches();

    let level = if matches.is_present("verbose") {
        Level::DEBUG
    } else {
        Level::WARN
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    let config = match matches.value_of("config") {
        Some(path) => SimBusConfig::from_file(path)?,
        None => SimBusConfig::default(),
    };
    debug!(bus = %config.name, devices = config.devices.len(), "configuration loaded");

    let runtime = Runtime::new()?;
    let driver = Arc::new(SimulatedBus::from_config(&config));
    let bus = BusMaster::new(Arc::clone(&driver), runtime.handle().clone());

    let format = match matches.value_of("format") {
        Some("json") => Format::Json,
        _ => Format::Table,
    };
    let ctx = Context {
        bus,
        driver,
        runtime,
        format,
        log: matches.is_present("log"),
    };

    match matches.subcommand() {
        ("search", Some(sub_matches)) => handle_search(&ctx, sub_matches),
        ("watch", Some(sub_matches)) => handle_watch(&ctx, sub_matches),
        ("convert", Some(sub_matches)) => handle_convert(&ctx, sub_matches),
        ("power-supply", Some(sub_matches)) => handle_power_supply(&ctx, sub_matches),
        ("read-scratchpad", Some(sub_matches)) => handle_read_scratchpad(&ctx, sub_matches),
        ("write-scratchpad", Some(sub_matches)) => handle_write_scratchpad(&ctx, sub_matches),
        ("devices", _) => handle_devices(&ctx),
        _ => {
            println!("{}", "No command specified. Use --help for usage information.".yellow());
            Ok(())
        }
    }
}

fn address_arg() -> Arg<'static, 'static> {
    Arg::with_name("address")
        .value_name("ADDRESS")
        .help("Device address (16 hex digits)")
        .required(true)
        .validator(|v| {
            v.parse::<DeviceAddress>()
                .map(|_| ())
                .map_err(|e| e.to_string())
        })
}

fn parse_family(value: &str) -> Result<u8, std::num::ParseIntError> {
    let digits = value.trim_start_matches("0x").trim_start_matches("0X");
    u8::from_str_radix(digits, 16)
}

fn parse_hex(value: &str) -> Result<Vec<u8>, String> {
    let digits = value.trim_start_matches("0x").trim_start_matches("0X");
    if digits.len() % 2 != 0 {
        return Err("Hex data must have an even number of digits".to_string());
    }
    (0..digits.len())
        .step_by(2)
        .map(|i| {
            digits
                .get(i..i + 2)
                .and_then(|pair| u8::from_str_radix(pair, 16).ok())
                .ok_or_else(|| format!("Invalid hex byte at offset {i}"))
        })
        .collect()
}

fn succeeded<R: CommandResult>(result: R) -> bool {
    result == R::SUCCESS
}

fn hex_string(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02X}")).collect()
}

fn required_address(matches: &ArgMatches<'_>) -> Result<DeviceAddress, Box<dyn std::error::Error>> {
    let value = matches.value_of("address").unwrap_or_default();
    Ok(value.parse::<DeviceAddress>()?)
}

/// Opens the bus before a device command. Reports and returns `false` on failure.
fn start_bus(ctx: &Context) -> Result<bool, Box<dyn std::error::Error>> {
    let start = ctx.bus.query_start_bus_cmd(ctx.log);
    let result = start.execute()?;
    print_log("start", &start.log_entries(), ctx);

    if succeeded(result) {
        return Ok(true);
    }
    print_outcome(ctx, "start", result.as_str(), false, json!({}));
    Ok(false)
}

fn handle_search(ctx: &Context, matches: &ArgMatches<'_>) -> CliResult {
    let criteria = if matches.is_present("alarm") {
        SearchCriteria::Alarming
    } else if let Some(family) = matches.value_of("family") {
        SearchCriteria::Family(parse_family(family)?)
    } else {
        SearchCriteria::All
    };

    if !start_bus(ctx)? {
        return Ok(());
    }

    let search = ctx.bus.query_search_cmd(criteria, ctx.log);
    let result = search.execute()?;
    print_log("search", &search.log_entries(), ctx);

    match search.result_search() {
        Ok(found) => print_search(ctx, &found),
        Err(_) => print_outcome(ctx, "search", result.as_str(), false, json!({ "criteria": criteria })),
    }
    Ok(())
}

fn handle_watch(ctx: &Context, matches: &ArgMatches<'_>) -> CliResult {
    let period_ms: u64 = matches.value_of("period").unwrap_or_default().parse()?;
    let duration = matches
        .value_of("duration")
        .map(str::parse::<u64>)
        .transpose()?
        .map(Duration::from_secs);
    let scope = if matches.is_present("alarm") {
        NotifyScope::Alarm
    } else {
        NotifyScope::General
    };

    if !start_bus(ctx)? {
        return Ok(());
    }

    let (subscriber, mut results) = Subscriber::channel("owbus-watch");
    ctx.bus.schedule_search_notify_for(scope, &subscriber, period_ms)?;

    if ctx.format == Format::Table {
        println!(
            "{} {} search every {} ms {}",
            "Watching".bright_blue().bold(),
            scope.to_string().bright_white(),
            period_ms.to_string().bright_cyan(),
            "(Ctrl-C to stop)".dimmed()
        );
    }

    ctx.runtime.block_on(async {
        let stop = async {
            match duration {
                Some(limit) => tokio::time::sleep(limit).await,
                None => {
                    let _ = tokio::signal::ctrl_c().await;
                }
            }
        };
        tokio::pin!(stop);

        loop {
            tokio::select! {
                () = &mut stop => break,
                received = results.recv() => match received {
                    Some(found) => print_search(ctx, &found),
                    None => break,
                },
            }
        }
    });

    ctx.bus.cancel_all_scheduled_search_notify();

    let stats = ctx.bus.notify_stats(scope);
    match ctx.format {
        Format::Json => println!("{}", json!({ "scope": scope, "stats": stats })),
        Format::Table => println!(
            "{} {} searches, {} suppressed as unchanged, {} delivered",
            "Done:".bright_white(),
            stats.results_received,
            stats.results_suppressed,
            stats.fan_outs + stats.cached_deliveries
        ),
    }
    Ok(())
}

fn handle_convert(ctx: &Context, matches: &ArgMatches<'_>) -> CliResult {
    let target = matches
        .value_of("address")
        .map(str::parse::<DeviceAddress>)
        .transpose()?;

    if !start_bus(ctx)? {
        return Ok(());
    }

    let convert = ctx.bus.query_convert_t_cmd(target, ctx.log);
    let result = convert.execute()?;
    print_log("convert", &convert.log_entries(), ctx);

    let target_text = target.map_or_else(|| "all".to_string(), |a| a.to_string());
    let mut details = json!({ "target": target_text });
    if let Ok(write_ctm) = convert.result_write_ctm() {
        details["write_ctm"] = json!(write_ctm);
    }
    print_outcome(ctx, "convert", result.as_str(), succeeded(result), details);
    Ok(())
}

fn handle_power_supply(ctx: &Context, matches: &ArgMatches<'_>) -> CliResult {
    let address = required_address(matches)?;
    if !start_bus(ctx)? {
        return Ok(());
    }

    let read = ctx.bus.query_read_power_supply_cmd(address, ctx.log);
    let result = read.execute()?;
    print_log("power-supply", &read.log_entries(), ctx);

    let mut details = json!({ "address": address });
    if let Ok(external) = read.result_externally_powered() {
        details["externally_powered"] = json!(external);
    }
    print_outcome(ctx, "power-supply", result.as_str(), succeeded(result), details);
    Ok(())
}

fn handle_read_scratchpad(ctx: &Context, matches: &ArgMatches<'_>) -> CliResult {
    let address = required_address(matches)?;
    let len: usize = matches.value_of("len").unwrap_or(DEFAULT_SCRATCHPAD_LEN).parse()?;
    if !start_bus(ctx)? {
        return Ok(());
    }

    let read = ctx.bus.query_read_scratchpad_cmd(address, len, ctx.log);
    let result = read.execute()?;
    print_log("read-scratchpad", &read.log_entries(), ctx);

    let mut details = json!({ "address": address });
    if let Ok(data) = read.result_data() {
        details["data"] = json!(hex_string(&data));
    }
    print_outcome(ctx, "read-scratchpad", result.as_str(), succeeded(result), details);
    Ok(())
}

fn handle_write_scratchpad(ctx: &Context, matches: &ArgMatches<'_>) -> CliResult {
    let address = required_address(matches)?;
    let data = parse_hex(matches.value_of("data").unwrap_or_default())?;
    if !start_bus(ctx)? {
        return Ok(());
    }

    let write = ctx.bus.query_write_scratchpad_cmd(address, &data, ctx.log);
    let result = write.execute()?;
    print_log("write-scratchpad", &write.log_entries(), ctx);

    let details = json!({ "address": address, "bytes": data.len() });
    print_outcome(ctx, "write-scratchpad", result.as_str(), succeeded(result), details);
    Ok(())
}

fn handle_devices(ctx: &Context) -> CliResult {
    let devices = ctx.driver.devices();
    match ctx.format {
        Format::Json => println!("{}", serde_json::to_string_pretty(&devices)?),
        Format::Table => {
            println!(
                "{}",
                format!("{:<18} {:>6} {:>6} {:>9} {:>7}  {}", "ADDRESS", "FAMILY", "ALARM", "POWER", "FAULTY", "SCRATCHPAD")
                    .bright_white()
                    .bold()
            );
            for device in &devices {
                let alarm = if device.alarm { "   yes".bright_red() } else { "    no".green() };
                let power = if device.externally_powered { "external" } else { "parasite" };
                let faulty = if device.faulty { "    yes".bright_red() } else { "     no".green() };
                println!(
                    "{:<18} {:>6} {} {:>9} {}  {}",
                    device.address.to_string().bright_cyan(),
                    format!("{:02X}", device.address.family_code()),
                    alarm,
                    power,
                    faulty,
                    hex_string(&device.scratchpad).dimmed()
                );
            }
            println!("{} device(s) on {}", devices.len(), ctx.bus.name());
        }
    }
    Ok(())
}

fn print_search(ctx: &Context, found: &SearchResult) {
    match ctx.format {
        Format::Json => println!("{}", json!({ "result": "success", "search": found })),
        Format::Table => {
            println!(
                "{} {} device(s), fingerprint {} at {}",
                "✅".green(),
                found.len().to_string().bright_green(),
                format!("{:08X}", found.fingerprint()).bright_white(),
                found.write_ctm().to_string().dimmed()
            );
            for address in found.addresses() {
                println!("   {}", address.to_string().bright_cyan());
            }
        }
    }
}

fn print_outcome(ctx: &Context, action: &str, result: &str, success: bool, details: serde_json::Value) {
    match ctx.format {
        Format::Json => {
            let mut output = json!({ "command": action, "result": result });
            if let (Some(output), Some(details)) = (output.as_object_mut(), details.as_object()) {
                output.extend(details.clone());
            }
            println!("{output}");
        }
        Format::Table => {
            let status = if success {
                format!("{} {}", "✅".green(), result.bright_green())
            } else {
                format!("{} {}", "❌".red(), result.bright_red())
            };
            println!("{} {}", action.bright_white(), status);
            if let Some(details) = details.as_object() {
                for (key, value) in details {
                    let text = value.as_str().map_or_else(|| value.to_string(), str::to_string);
                    println!("   {:<20} {}", key.dimmed(), text.bright_cyan());
                }
            }
        }
    }
}

fn print_log(action: &str, entries: &[LogEntry], ctx: &Context) {
    if !ctx.log || entries.is_empty() {
        return;
    }
    match ctx.format {
        Format::Json => println!("{}", json!({ "command": action, "log": entries })),
        Format::Table => {
            for entry in entries {
                let level = match entry.level {
                    LogLevel::Debug => entry.level.to_string().dimmed(),
                    LogLevel::Info => entry.level.to_string().blue(),
                    LogLevel::Warning => entry.level.to_string().yellow(),
                    LogLevel::Error => entry.level.to_string().red(),
                };
                println!("   [{}] {} {}", action.dimmed(), level, entry.message);
            }
        }
    }
}
