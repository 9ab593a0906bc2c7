extern crate tokenkeeper;

use tokenkeeper::cli::options::Options;

fn main() {
    let options = Options::from_args();
    let format = options.general.format;

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Could not start runtime: {e}");
            ::std::process::exit(1);
        }
    };

    match runtime.block_on(options.run()) {
        Ok(report) => println!("{}", report.report(format)),
        Err(e) => {
            eprintln!("{e}");
            ::std::process::exit(1);
        }
    }
}
