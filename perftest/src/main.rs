
use channel_net::NetworkSettings;
use log::{error, LevelFilter};
use std::{
    env,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

const USAGE: &str = "Usage:
    perftest server <port>
    perftest echoserver <port>
    perftest network <host> <port> <count> <size>
    perftest sendfile <host> <port> <file>
    perftest memory <port>";

fn main() {
    let mut clog = colog::default_builder();

    #[cfg(debug_assertions)]
    clog.filter_level(LevelFilter::Debug);

    #[cfg(not(debug_assertions))]
    clog.filter_level(LevelFilter::Warn);

    clog.init();

    // Settings files are optional, CHANNEL_NET_ENVIRONMENT selects the override file
    let environment = env::var("CHANNEL_NET_ENVIRONMENT").unwrap_or_else(|_| String::from("dev"));
    let settings = match NetworkSettings::load(&environment) {
        Ok(settings) => Arc::new(settings),
        Err(e) => {
            error!("{e}");
            return;
        }
    };

    // Handle SIGTERM by setting the stop_signal boolean
    let stop_signal = Arc::new(AtomicBool::new(false));
    let handler_signal = stop_signal.clone();
    if let Err(e) = ctrlc::set_handler(move || handler_signal.store(true, Ordering::Relaxed)) {
        error!("Unable to install Ctrl-C handler: {e}");
        return;
    }

    let args: Vec<String> = env::args().collect();
    let args: Vec<&str> = args.iter().map(String::as_str).collect();
    match args.get(1..).unwrap_or_default() {
        ["server", port] => server_test::run_server(&settings, &stop_signal, parse(port), false),
        ["echoserver", port] => server_test::run_server(&settings, &stop_signal, parse(port), true),
        ["network", host, port, count, size] => {
            client_test::run_connections(&settings, &stop_signal, host, parse(port), parse(count), parse(size))
        }
        ["sendfile", host, port, file] => client_test::send_file(&settings, &stop_signal, host, parse(port), file),
        ["memory", port] => client_test::churn_connections(&settings, &stop_signal, parse(port)),
        _ => println!("{USAGE}"),
    }
}

fn parse<T: std::str::FromStr + Default>(arg: &str) -> T {
    match arg.parse() {
        Ok(value) => value,
        Err(_) => {
            error!("'{arg}' is not a valid number, using the default");
            T::default()
        }
    }
}

pub(crate) fn thousands(number: u64) -> String {
    let number = number.to_string();
    number
        .as_bytes()
        .rchunks(3)
        .rev()
        .filter_map(|chunk| std::str::from_utf8(chunk).ok())
        .collect::<Vec<&str>>()
        .join(",")
}
