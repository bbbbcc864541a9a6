fn main() {
    match cuesync::run() {
        Ok(code) => std::process::exit(code),
        Err(error) => {
            cuesync::logging::report_failure(&error);
            std::process::exit(1);
        }
    }
}
