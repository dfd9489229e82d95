use spotbridged::DaemonError;

fn main() -> Result<(), DaemonError> {
    spotbridged::start().inspect_err(|err| eprintln!("{err}"))
}
