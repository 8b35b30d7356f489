use std::process::ExitCode;

fn main() -> ExitCode {
    match homie_modbus::boot::start() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("{err:#}");
            eprintln!("Error: {err:#}");
            ExitCode::FAILURE
        }
    }
}
