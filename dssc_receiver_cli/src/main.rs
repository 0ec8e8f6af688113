use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use indicatif_log_bridge::LogWrapper;
use std::fs::File;
use std::io::Write;
use std::net::{SocketAddr, UdpSocket};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use libdssc_receiver::config::Config;
use libdssc_receiver::generator::{send_train, TrainGenerator};
use libdssc_receiver::sorter::{NextTrain, Sorter};

fn make_template_config(path: &Path) {
    let config = Config::default();
    let yaml_str = serde_yaml::to_string(&config).unwrap();
    let mut file = File::create(path).expect("Could create template config file!");
    file.write_all(yaml_str.as_bytes())
        .expect("Failed to write yaml data to file!");
}

/// Take trains until the Sorter ends or `limit` trains were consumed, reporting the
/// Sorter status on `pb`
fn consume(sorter: Arc<Sorter>, limit: Option<u64>, pb: ProgressBar) -> u64 {
    let consumer = {
        let sorter = sorter.clone();
        std::thread::spawn(move || {
            let mut consumed = 0;
            loop {
                if limit.is_some_and(|limit| consumed >= limit) {
                    break;
                }
                match sorter.get_next(Duration::from_millis(500)) {
                    NextTrain::Train(train) => {
                        log::debug!(
                            "Consumed train {} with {} pulses",
                            train.train_id(),
                            train.pulse_count()
                        );
                        consumed += 1;
                        if let Err(e) = sorter.release(train) {
                            log::error!("{e}");
                            break;
                        }
                    }
                    NextTrain::Timeout => (),
                    NextTrain::Ended => break,
                }
            }
            consumed
        })
    };

    loop {
        // No UI here, so poll the status about once a second
        std::thread::sleep(Duration::from_secs(1));
        let status = sorter.status();
        pb.set_position(status.sorted_trains);
        pb.set_message(status.summary());

        if consumer.is_finished() {
            break;
        }
    }

    let consumed = match consumer.join() {
        Ok(consumed) => consumed,
        Err(_) => {
            log::error!("Failed to join consumer task!");
            0
        }
    };
    pb.finish();
    consumed
}

fn load_config(matches: &ArgMatches) -> Option<Config> {
    let Some(config_path) = matches.get_one::<String>("path").map(PathBuf::from) else {
        log::info!("No config given, using the defaults");
        return Some(Config::default());
    };
    log::info!("Loading config from {}...", config_path.to_string_lossy());
    match Config::read_config_file(&config_path) {
        Ok(c) => {
            log::info!("Config successfully loaded.");
            log::info!("UDP Port: {}", c.udp_port);
            log::info!(
                "ASICs: {:?} (ladder mode: {})",
                c.sending_asics(),
                c.is_ladder_mode()
            );
            log::info!("SRAM Depth: {}", c.sram_depth);
            log::info!(
                "Pool Sizes: {} unsorted, {} sorted (drop oldest: {})",
                c.unsorted_pool_size,
                c.sorted_pool_size,
                c.drop_oldest
            );
            Some(c)
        }
        Err(e) => {
            log::error!("{e}");
            None
        }
    }
}

fn run_sorter(config: Config, directory: Option<PathBuf>, limit: Option<u64>, pb: ProgressBar) {
    let sorter = match Sorter::new(config) {
        Ok(sorter) => Arc::new(sorter),
        Err(e) => {
            log::error!("Could not create the sorter: {e}");
            return;
        }
    };
    let started = match &directory {
        Some(dir) => sorter.read_from_directory(dir),
        None => sorter.start(),
    };
    if let Err(e) = started {
        log::error!("Could not start the sorter: {e}");
        return;
    }

    let consumed = consume(sorter.clone(), limit, pb);
    log::info!("Consumed {consumed} trains");
    match sorter.stop() {
        Ok(()) => log::info!("Final status: {}", sorter.status().summary()),
        Err(e) => log::error!("Sorter failed with error: {e}"),
    }
}

fn send_trains(config: &Config, matches: &ArgMatches, pb: ProgressBar) {
    let Some(target) = matches.get_one::<SocketAddr>("target").copied() else {
        log::error!("A target address is required");
        return;
    };
    let count = *matches.get_one::<u64>("count").unwrap_or(&10);
    let pulses = *matches.get_one::<usize>("pulses").unwrap_or(&config.sram_depth);
    let pause = Duration::from_millis(*matches.get_one::<u64>("pause").unwrap_or(&100));
    let first_id = *matches.get_one::<u64>("first").unwrap_or(&1);

    let generator = if matches.get_flag("dummy") {
        TrainGenerator::dummy(pulses, config.sending_asics())
    } else {
        TrainGenerator::from_config(config, pulses)
    };
    let socket = match UdpSocket::bind("0.0.0.0:0") {
        Ok(socket) => socket,
        Err(e) => {
            log::error!("Could not open a UDP socket: {e}");
            return;
        }
    };
    log::info!(
        "Sending {count} trains of {pulses} pulses to {target} ({} each)",
        human_bytes::human_bytes(generator.format().total_bytes() as f64)
    );

    pb.set_length(count);
    let mut scratch = Vec::new();
    for (frame, train_id) in (first_id..first_id + count).enumerate() {
        let train = generator.train_bytes(train_id);
        if let Err(e) = send_train(&socket, target, &train, frame as u32 + 1, &mut scratch) {
            log::error!("Sending train {train_id} failed: {e}");
            return;
        }
        pb.inc(1);
        std::thread::sleep(pause);
    }
    pb.finish();
}

fn main() {
    // Create a cli
    let matches = Command::new("dssc_receiver_cli")
        .arg_required_else_help(true)
        .arg(
            Arg::new("path")
                .short('p')
                .long("path")
                .help("Path to the config file"),
        )
        .subcommand(Command::new("new").about("Make a template configuration yaml file"))
        .subcommand(
            Command::new("run")
                .about("Receive and sort trains over UDP")
                .arg(
                    Arg::new("trains")
                        .short('n')
                        .long("trains")
                        .value_parser(value_parser!(u64))
                        .help("Stop after this many trains"),
                ),
        )
        .subcommand(
            Command::new("replay")
                .about("Sort the train files of a directory")
                .arg(Arg::new("directory").required(true)),
        )
        .subcommand(
            Command::new("send")
                .about("Send synthetic trains over UDP")
                .arg(
                    Arg::new("target")
                        .short('t')
                        .long("target")
                        .required(true)
                        .value_parser(value_parser!(SocketAddr)),
                )
                .arg(
                    Arg::new("count")
                        .short('c')
                        .long("count")
                        .default_value("10")
                        .value_parser(value_parser!(u64)),
                )
                .arg(
                    Arg::new("pulses")
                        .long("pulses")
                        .value_parser(value_parser!(usize)),
                )
                .arg(
                    Arg::new("first")
                        .long("first")
                        .default_value("1")
                        .value_parser(value_parser!(u64))
                        .help("Id of the first train"),
                )
                .arg(
                    Arg::new("pause")
                        .long("pause")
                        .default_value("100")
                        .value_parser(value_parser!(u64))
                        .help("Pause between trains in ms"),
                )
                .arg(
                    Arg::new("dummy")
                        .long("dummy")
                        .action(ArgAction::SetTrue)
                        .help("Send DR dummy data"),
                ),
        )
        .get_matches();

    // Initialize feedback
    let logger = simplelog::TermLogger::new(
        simplelog::LevelFilter::Info,
        simplelog::Config::default(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    );

    let pb_manager = MultiProgress::new();

    LogWrapper::new(pb_manager.clone(), logger)
        .try_init()
        .expect("Could not create logging/progress!");

    if let Some(("new", _)) = matches.subcommand() {
        let Some(config_path) = matches.get_one::<String>("path").map(PathBuf::from) else {
            log::error!("new requires a config path (-p)");
            return;
        };
        log::info!(
            "Making a template config at {}...",
            config_path.to_string_lossy()
        );
        make_template_config(&config_path);
        log::info!("Done.");
        return;
    }

    let Some(config) = load_config(&matches) else {
        return;
    };

    // Setup the progress bar
    let pb = pb_manager.add(ProgressBar::new_spinner());
    pb.set_style(
        ProgressStyle::with_template("{spinner} [{elapsed_precise}] {pos} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );

    match matches.subcommand() {
        Some(("run", sub)) => {
            let limit = sub.get_one::<u64>("trains").copied();
            run_sorter(config, None, limit, pb);
        }
        Some(("replay", sub)) => {
            let directory = sub.get_one::<String>("directory").map(PathBuf::from);
            run_sorter(config, directory, None, pb);
        }
        Some(("send", sub)) => {
            pb.set_style(
                ProgressStyle::with_template("[{elapsed_precise}] {bar:40} {pos}/{len}")
                    .unwrap_or_else(|_| ProgressStyle::default_bar()),
            );
            send_trains(&config, sub, pb);
        }
        _ => (),
    }

    log::info!("Done.");
}
