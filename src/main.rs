use trace_inputs::{TRACING_FAILURE_EXIT_CODE, TracingFailure, clean_logger};

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let code = match trace_inputs::cli::run().await {
        Ok(code) => code,
        Err(err) => {
            clean_logger();
            eprintln!("Error: {err:#}");
            if err.downcast_ref::<TracingFailure>().is_some() {
                TRACING_FAILURE_EXIT_CODE
            } else {
                1
            }
        }
    };
    std::process::exit(code);
}
