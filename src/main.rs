use std::{
    path::PathBuf,
    sync::mpsc,
    thread,
    time::Duration,
};

use clap::Parser;
use console::{style, Emoji};
use indicatif::{ProgressBar, ProgressStyle};

use sfxpack::{pipeline, BuildError, BuildOutcome, BuildReport, BuildSession, Progress, Project};

#[derive(Parser)]
#[command(about, version)]
pub struct Args {
    /// Path to the package project file
    project:  PathBuf,
    /// Path to the extractor stub used as the executable template
    #[arg(short, long)]
    template: Option<PathBuf>,
    /// Override the output file configured in the project
    #[arg(short, long)]
    output:   Option<PathBuf>,
    /// Path to the external archiver used for .gz/.gzip bundles
    #[arg(long)]
    tool:     Option<PathBuf>,
}

enum Event {
    Line(String),
    Progress(Progress),
    Done(Result<BuildReport, BuildError>),
}

fn main() {
    color_backtrace::install();

    let args = Args::parse();

    let mut project = Project::load(&args.project).unwrap_or_else(|e| {
        println!(
            "{}: {}",
            style("couldn't load the project").red(),
            e
        );
        std::process::exit(-1);
    });
    if let Some(output) = &args.output {
        project.settings.output_file = output.display().to_string();
    }
    let base_dir = args
        .project
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));

    println!(
        "{} {}building {} from {}…",
        style("[1/2]").bold().black(),
        Emoji("🚚 ", ""),
        style(&project.settings.caption).blue(),
        style(args.project.display()).blue()
    );

    let bar = ProgressBar::new(100).with_style(
        ProgressStyle::with_template(
            "{spinner:.green} {elapsed_precise} [{wide_bar:.green}] {pos}%",
        )
        .expect("the progress template is valid"),
    );
    bar.enable_steady_tick(Duration::from_millis(120));

    let session = BuildSession::new();
    let (sender, receiver) = mpsc::channel::<Event>();

    let result = thread::scope(|scope| {
        scope.spawn(|| {
            let log = |line: &str| {
                let _ = sender.send(Event::Line(line.to_string()));
            };
            let progress = |progress: Progress| {
                let _ = sender.send(Event::Progress(progress));
            };
            let result = pipeline::run(
                &project,
                &base_dir,
                args.template.as_deref(),
                args.tool.as_deref(),
                &session,
                &log,
                &progress,
            );
            let _ = sender.send(Event::Done(result));
        });

        loop {
            match receiver.recv() {
                Ok(Event::Line(line)) => bar.println(line),
                Ok(Event::Progress(Progress::Percent(percent))) => {
                    bar.set_position(percent as u64);
                }
                Ok(Event::Progress(Progress::Indeterminate)) => bar.tick(),
                Ok(Event::Progress(Progress::Clear)) => {}
                Ok(Event::Done(result)) => break result,
                Err(_) => break Err(BuildError::Cancelled),
            }
        }
    });
    bar.finish_and_clear();

    println!(
        "{} {}writing summary…",
        style("[2/2]").bold().black(),
        Emoji("📃 ", "")
    );
    match result {
        Ok(report) if report.outcome == BuildOutcome::Completed => {
            println!(
                "      {}{} {} {} {} {}",
                Emoji("✨ ", ""),
                style("successfully packed").green(),
                style(report.added_count).magenta(),
                style("files into").green(),
                style(report.volume_count).magenta(),
                style("volume(s)").green(),
            );
            println!(
                "      {:.2}MB compressed to {:.2}MB ({:.2}%), finished in {}",
                pipeline::megabytes(report.uncompressed_bytes),
                pipeline::megabytes(report.compressed_bytes),
                report.compression_percent(),
                report.elapsed_display(),
            );
        }
        Ok(report) => {
            println!(
                "      {}{} {}",
                Emoji("⚠ ", ""),
                style("cancelled after").yellow(),
                style(report.elapsed_display()).yellow(),
            );
        }
        Err(error) => {
            println!("{}: {}", style("build failed").red(), error);
            std::process::exit(-1);
        }
    }
}
