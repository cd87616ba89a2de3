//! `aurga_ctl`: drives the configuration record and the firmware
//! update pipeline against a flash device or a flash image file.
use anyhow::{anyhow, bail, Context};
use aurga_fw_lib::{
    config::Settings,
    devices::{
        control::{ioctl_number, Control, ControlRequest, ControlResponse, LocalUpdate, BIND_LENGTH},
        eeprom::{record::UID_LENGTH, ConfigStore, Record},
        indicator::StatusIndicator,
        topology::Topology,
        updater::{Peripherals, UpdateService},
    },
    drivers::{
        hosted::{DarkLed, LogOnlyRestart, UntouchedProcesses},
        image_file::{ImageFile, ImageFileDevice},
        linux::{LinuxPlatform, ProcfsProcesses, SysRqRestart, SysfsLed},
    },
    hal::system::{Platform, Processes, Restart},
};
use clap::{clap_app, ArgMatches};
use log::{debug, LevelFilter};
use std::{fs, path::Path, process, sync::Arc};

struct Services {
    restart: Arc<dyn Restart>,
    processes: Arc<dyn Processes>,
    indicator: Arc<StatusIndicator>,
}

fn services(settings: &Settings, on_device: bool) -> Services {
    let period = settings.indicator_period();
    if !on_device {
        return Services {
            restart: Arc::new(LogOnlyRestart),
            processes: Arc::new(UntouchedProcesses),
            indicator: Arc::new(StatusIndicator::new(DarkLed::default(), DarkLed::default(), period)),
        };
    }
    let indicator = match settings.leds {
        Some(pins) => StatusIndicator::new(SysfsLed::export(pins.red), SysfsLed::export(pins.green), period),
        None => StatusIndicator::new(DarkLed::default(), DarkLed::default(), period),
    };
    Services {
        restart: Arc::new(SysRqRestart::new()),
        processes: Arc::new(ProcfsProcesses::new()),
        indicator: Arc::new(indicator),
    }
}

fn load_settings(path: Option<&str>) -> anyhow::Result<Settings> {
    match path {
        Some(path) => {
            let text = fs::read_to_string(path).with_context(|| format!("Failed to read {}", path))?;
            Settings::from_ron(&text).with_context(|| format!("Invalid settings in {}", path))
        }
        None => Ok(Settings::default()),
    }
}

fn init_logging(settings: &Settings) {
    let level = if settings.debug_logging { LevelFilter::Debug } else { LevelFilter::Warn };
    env_logger::Builder::new().filter_level(level).parse_default_env().init();
}

fn parse_hex(text: &str) -> anyhow::Result<Vec<u8>> {
    let text = text.trim_start_matches("0x");
    if text.len() % 2 != 0 {
        bail!("hex string {:?} has an odd number of digits", text);
    }
    (0..text.len())
        .step_by(2)
        .map(|i| {
            text.get(i..i + 2)
                .and_then(|digits| u8::from_str_radix(digits, 16).ok())
                .ok_or_else(|| anyhow!("invalid hex digits in {:?}", text))
        })
        .collect()
}

fn hex(bytes: &[u8]) -> String { bytes.iter().map(|b| format!("{:02X}", b)).collect() }

fn parse_resolution(text: &str) -> anyhow::Result<u32> {
    let (width, height) = text.split_once('x').ok_or_else(|| anyhow!("expected WIDTHxHEIGHT, got {:?}", text))?;
    let width: u16 = width.parse().context("width")?;
    let height: u16 = height.parse().context("height")?;
    Ok(width as u32 | (height as u32) << 16)
}

/// Translates a subcommand into the ioctl it stands for.
fn ioctl_for(name: &str, arguments: &ArgMatches) -> anyhow::Result<(u8, Vec<u8>)> {
    let value = |key: &str| arguments.value_of(key).ok_or_else(|| anyhow!("missing {}", key));
    Ok(match name {
        "update" => (0, Vec::new()),
        "speed" => match arguments.value_of("MODE") {
            Some(mode) => (2, mode.parse::<u32>().context("HID mode")?.to_le_bytes().to_vec()),
            None => (1, Vec::new()),
        },
        "resolution" => match arguments.value_of("SIZE") {
            Some(size) => (4, parse_resolution(size)?.to_le_bytes().to_vec()),
            None => (3, Vec::new()),
        },
        "bind" => {
            let uid = parse_hex(value("UID")?)?;
            if uid.len() != UID_LENGTH {
                bail!("UID must be {} bytes", UID_LENGTH);
            }
            let server = arguments.value_of("SERVER").unwrap_or("").as_bytes();
            if server.len() > BIND_LENGTH - UID_LENGTH {
                bail!("server name longer than {} bytes", BIND_LENGTH - UID_LENGTH);
            }
            let mut argument = vec![0u8; BIND_LENGTH];
            argument[..UID_LENGTH].copy_from_slice(&uid);
            argument[UID_LENGTH..UID_LENGTH + server.len()].copy_from_slice(server);
            (5, argument)
        }
        "unbind" => (6, Vec::new()),
        "serial" => (7, Vec::new()),
        "dump" => (80, Vec::new()),
        "reset" => (81, Vec::new()),
        other => bail!("unknown control command {}", other),
    })
}

fn show(record: &Record, store: &ConfigStore<ImageFile>) {
    println!("record:      {:?}{}", store.provenance(), if store.is_degraded() { " (read only)" } else { "" });
    println!("version:     {}", record.version);
    println!("hid 2.0:     {}", record.usb.hid_2_0 != 0);
    println!("resolution:  {}x{}", record.edid.width, record.edid.height);
    println!("edid used:   {}", record.edid.edid_used != 0);
    println!("bound:       {}", record.account.device_bound != 0);
    println!("uid:         {}", hex(&record.account.uid));
    println!("server:      {}", String::from_utf8_lossy(record.cloud_server()));
}

fn show_topology(device: &ImageFileDevice, settings: &Settings, platform: &dyn Platform) {
    let topology = Topology::discover(device);
    println!("flash size:  {:#010X}", topology.flash_size());
    println!("memory:      {} KiB", platform.memory_kb());
    for partition in topology.partitions() {
        println!("mtd{:<2}       {:#010X} + {:#010X}", partition.index, partition.offset, partition.size);
    }
    let record = settings.layout.bootloader_size as usize + settings.record_offset as usize;
    match topology.containing(record) {
        Some(partition) => println!("record:      mtd{} at {:#010X}", partition.index, record),
        None => println!("record:      outside the partition table"),
    }
}

fn run() -> anyhow::Result<()> {
    let matches = clap_app!(app =>
        (name: env!("CARGO_PKG_NAME"))
        (version: env!("CARGO_PKG_VERSION"))
        (about: env!("CARGO_PKG_DESCRIPTION"))
        (@arg config: -c --config +takes_value "RON settings file.")
        (@arg image: -i --image +takes_value +required "Flash image file standing in for the device.")
        (@arg create: --create "Create a blank flash image first.")
        (@arg device: --device "Restart, terminate processes and drive LEDs for real.")
        (@subcommand show => (about: "Print the configuration record."))
        (@subcommand topology => (about: "Print the flash partition table."))
        (@subcommand dump => (about: "Print the encoded configuration record."))
        (@subcommand speed => (about: "Get or set the HID 2.0 mode.")
            (@arg MODE: "0 or 1."))
        (@subcommand resolution => (about: "Get or set the display resolution.")
            (@arg SIZE: "WIDTHxHEIGHT."))
        (@subcommand bind => (about: "Bind the device to an account.")
            (@arg UID: +required "Account id, 32 hex digits.")
            (@arg SERVER: "Custom cloud server."))
        (@subcommand unbind => (about: "Unbind the device."))
        (@subcommand reset => (about: "Zero the configuration record."))
        (@subcommand serial => (about: "Print the device serial number."))
        (@subcommand update => (about: "Write the firmware file to flash.")
            (@arg FILE: "Firmware file, instead of the configured one."))
        (@subcommand report => (about: "Feed one vendor HID report to the update channel.")
            (@arg REPORT: +required "Report bytes in hex, report id first."))
    )
    .get_matches();

    let mut settings = load_settings(matches.value_of("config"))?;
    init_logging(&settings);

    let (name, arguments) = match matches.subcommand() {
        (name, Some(arguments)) => (name, arguments),
        _ => bail!("no command given, see --help"),
    };
    if let Some(file) = arguments.value_of("FILE") {
        settings.firmware_file = file.into();
    }

    let image = Path::new(matches.value_of("image").ok_or_else(|| anyhow!("missing image"))?);
    let device = Arc::new(if matches.is_present("create") {
        ImageFileDevice::create(image, &settings.layout, settings.erase_block_size)
    } else {
        ImageFileDevice::open(image, &settings.layout, settings.erase_block_size)
    }
    .with_context(|| format!("Failed to open flash image {:?}", image))?);

    let Services { restart, processes, indicator } = services(&settings, matches.is_present("device"));
    let platform: Arc<dyn Platform> = Arc::new(LinuxPlatform::new(settings.serial_number()));
    let store = Arc::new(ConfigStore::open(&*device, &settings, Arc::clone(&restart))?);
    let updater = Arc::new(UpdateService::new(
        Arc::clone(&device),
        settings.clone(),
        Peripherals { restart, processes, platform: Arc::clone(&platform), indicator },
    )?);

    match name {
        "show" => show(&store.record(), &store),
        "topology" => show_topology(&device, &settings, &*platform),
        "report" => {
            let report = parse_hex(arguments.value_of("REPORT").unwrap_or_default())?;
            let reply = updater.handle_report(&report);
            updater.wait_idle();
            match reply {
                Some(reply) => println!("{}", hex(reply.as_bytes())),
                None => println!("no reply"),
            }
        }
        _ => {
            let (nr, argument) = ioctl_for(name, arguments)?;
            let request = ControlRequest::from_ioctl(ioctl_number(nr), &argument)?;
            debug!("Dispatching {:?}", request);
            let local: Arc<dyn LocalUpdate> = updater.clone();
            let control = Control::new(Arc::clone(&store), platform, Some(local));
            match control.dispatch(request)? {
                ControlResponse::Done => {}
                ControlResponse::Value(value) => println!("{:#010X}", value),
                ControlResponse::Bytes(bytes) => println!("{}", hex(&bytes)),
            }
            updater.wait_idle();
            if name == "update" {
                let progress = updater.progress();
                println!("{:?}: {} bytes written", progress.status, progress.bytes);
            }
            store.flush();
            if let Some(e) = store.last_failure() {
                bail!("Configuration record was not saved: {}", e);
            }
        }
    }
    Ok(())
}

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {:#}", e);
        process::exit(1)
    }
}
