use std::fs::OpenOptions;
use std::io::BufWriter;
use std::process::ExitCode;

use clap::Parser;

use fml::cli::{Cli, Command};
use fml::error::FmlError;
use fml::hashmap::FmlMap;
use fml::heap::Heap;
use fml::loader;
use fml::vm::Vm;

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{err}");
            ExitCode::from(err.exit_code() as u8)
        }
    }
}

fn run(cli: Cli) -> Result<(), FmlError> {
    let Command::Execute {
        file,
        heap_log,
        heap_size,
    } = cli.command;

    log::info!("reading {}", file.display());
    let bytes = std::fs::read(&file)?;

    let mut heap = Heap::new(heap_size * 1024 * 1024);
    if let Some(path) = heap_log {
        let sink = OpenOptions::new().create(true).append(true).open(path)?;
        heap.set_heap_log(Box::new(BufWriter::new(sink)));
    }

    let mut globals = FmlMap::new();
    let chunk = loader::load(&bytes, &mut heap, &mut globals)?;
    log::info!(
        "linked {} constants, {} globals",
        chunk.constants.len(),
        chunk.global_names.len()
    );

    let stdout = Box::new(std::io::stdout());
    let mut vm = Vm::new(&chunk, heap, globals, stdout);
    vm.run()
}
