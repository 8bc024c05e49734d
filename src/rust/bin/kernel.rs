// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

#![deny(clippy::all)]

//======================================================================================================================
// Imports
//======================================================================================================================

use ::anyhow::Result;
use ::clap::{
    Arg,
    ArgAction,
    ArgMatches,
    Command,
};
use ::schedkernel::{
    kernel::{
        config::{
            Config,
            SchedulerOptions,
            TransportOptions,
        },
        handlers,
        peers::{
            MemoryService,
            RemoteMemory,
            KERNEL_ORIGIN,
        },
        Kernel,
    },
    runtime::{
        logging,
        network::{
            PeerClient,
            Server,
        },
    },
};
use ::std::{
    io::{
        self,
        BufRead,
    },
    net::SocketAddr,
    sync::Arc,
    thread,
};

//======================================================================================================================
// Structures
//======================================================================================================================

#[derive(Debug)]
struct ProgramArguments {
    config_path: String,
    program: String,
    size: u64,
    wait_for_enter: bool,
}

impl ProgramArguments {
    const DEFAULT_CONFIG_PATH: &'static str = "config/kernel.yaml";

    fn new() -> Result<Self> {
        let matches: ArgMatches = Command::new("kernel")
            .about("Admits, schedules and dispatches processes to networked CPU, memory and I/O peers")
            .arg(
                Arg::new("config")
                    .long("config")
                    .value_parser(clap::value_parser!(String))
                    .required(false)
                    .value_name("PATH")
                    .help("Sets the configuration file"),
            )
            .arg(
                Arg::new("wait")
                    .long("wait")
                    .action(ArgAction::SetTrue)
                    .help("Waits for ENTER before starting the schedulers"),
            )
            .arg(
                Arg::new("program")
                    .value_parser(clap::value_parser!(String))
                    .required(true)
                    .value_name("PROGRAM")
                    .help("Program of the initial process"),
            )
            .arg(
                Arg::new("size")
                    .value_parser(clap::value_parser!(u64))
                    .required(true)
                    .value_name("SIZE")
                    .help("Memory size of the initial process"),
            )
            .get_matches();

        let config_path: String = matches
            .get_one::<String>("config")
            .cloned()
            .unwrap_or_else(|| Self::DEFAULT_CONFIG_PATH.to_string());
        let program: String = match matches.get_one::<String>("program") {
            Some(program) => program.clone(),
            None => anyhow::bail!("missing initial program"),
        };
        let size: u64 = match matches.get_one::<u64>("size") {
            Some(size) => *size,
            None => anyhow::bail!("missing initial process size"),
        };

        Ok(Self {
            config_path,
            program,
            size,
            wait_for_enter: matches.get_flag("wait"),
        })
    }
}

//======================================================================================================================
// main()
//======================================================================================================================

fn main() -> Result<()> {
    let args: ProgramArguments = ProgramArguments::new()?;
    let config: Config = Config::new(&args.config_path)?;
    logging::initialize(&config.log_level()?);

    let transport: TransportOptions = config.transport_options()?;
    let options: SchedulerOptions = config.scheduler_options()?;
    let memory_addr: SocketAddr = config.memory_addr()?;
    let memory: Arc<dyn MemoryService> = Arc::new(RemoteMemory::new(
        PeerClient::new(KERNEL_ORIGIN, memory_addr).with_timeouts(transport.connect_timeout, transport.request_timeout),
    ));

    let kernel: Arc<Kernel> = Kernel::new(options, transport, memory)?;
    let server: Server = match Server::start(config.listen_addr()?, handlers::handler(kernel.clone())) {
        Ok(server) => server,
        Err(e) => {
            log::error!("main(): cannot start listener ({})", e);
            kernel.shutdown();
            return Err(e.into());
        },
    };
    log::info!("listening on {}, memory at {}", server.local_addr(), memory_addr);

    kernel.create_process(Some(0), &args.program, args.size)?;
    if args.wait_for_enter {
        println!("Press ENTER to start scheduling...");
        let mut line: String = String::new();
        io::stdin().lock().read_line(&mut line)?;
    }
    kernel.start()?;

    // Workers terminate the process on fatal errors. Otherwise the kernel runs until killed.
    loop {
        thread::park();
    }
}
