use burn::backend::NdArray;
use dotenv::dotenv;
use keeplord_policy::{ExportPipeline, ExportSettings};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("keeplord_policy=debug,info"));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    init_logging();

    let settings = ExportSettings::from_env()?;
    tracing::info!(
        "Exporting {} keeps on a {:?} map to {}",
        settings.policy.n_keeps,
        settings.policy.input_shape,
        settings.output_dir.join(&settings.artifact_name).display()
    );

    let device = Default::default();
    let report = ExportPipeline::new(settings).run::<NdArray>(&device)?;

    println!("{report}");
    Ok(())
}
