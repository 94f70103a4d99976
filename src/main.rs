fn main() -> anyhow::Result<std::process::ExitCode> {
    occupancy_classifier::app::run()
}
