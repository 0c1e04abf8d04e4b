//! Integration tests for kfx-dist

mod cli_tests {
    use assert_cmd::{cargo::cargo_bin_cmd, Command};
    use predicates::prelude::*;
    use tempfile::TempDir;

    /// Binary with a config path that does not exist, so defaults apply
    fn kfx_dist(dir: &TempDir) -> Command {
        let mut cmd = cargo_bin_cmd!("kfx-dist");
        cmd.env("KFX_DIST_CONFIG", dir.path().join("config.toml"))
            .env_remove("RUST_LOG");
        cmd
    }

    #[test]
    fn help_displays() {
        let dir = TempDir::new().unwrap();
        kfx_dist(&dir)
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("KF/x and its Xen hypervisor"))
            .stdout(predicate::str::contains("--list-targets"));
    }

    #[test]
    fn version_displays() {
        let dir = TempDir::new().unwrap();
        kfx_dist(&dir)
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("kfx-dist"));
    }

    #[test]
    fn missing_target_prints_usage() {
        let dir = TempDir::new().unwrap();
        kfx_dist(&dir)
            .assert()
            .code(1)
            .stderr(predicate::str::contains("Usage:"))
            .stdout(predicate::str::is_empty());
    }

    #[test]
    fn unknown_target_fails_before_engine() {
        let dir = TempDir::new().unwrap();
        kfx_dist(&dir)
            .args(["--engine", "kfx-dist-no-such-engine", "warty"])
            .arg(dir.path().join("out"))
            .assert()
            .failure()
            .stderr(predicate::str::contains("Unknown target: warty"))
            .stderr(predicate::str::contains("focal"))
            .stderr(predicate::str::contains("--list-targets"));

        assert!(!dir.path().join("out").exists());
    }

    #[test]
    fn missing_engine_is_reported() {
        let dir = TempDir::new().unwrap();
        kfx_dist(&dir)
            .args(["--engine", "kfx-dist-no-such-engine", "focal"])
            .arg(dir.path().join("out"))
            .assert()
            .failure()
            .stderr(predicate::str::contains("Container engine not found"));
    }

    #[test]
    fn list_targets_shows_defaults() {
        let dir = TempDir::new().unwrap();
        kfx_dist(&dir)
            .arg("--list-targets")
            .assert()
            .success()
            .stdout(predicate::str::contains("buster"))
            .stdout(predicate::str::contains("ubuntu:jammy"))
            .stdout(predicate::str::contains("18.04"));
    }

    #[test]
    fn list_targets_uses_config() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("config.toml"),
            "[[targets]]\nname = \"noble\"\nbase_image = \"ubuntu:noble\"\nversion_label = \"24.04\"\n",
        )
        .unwrap();

        kfx_dist(&dir)
            .arg("--list-targets")
            .assert()
            .success()
            .stdout(predicate::str::contains("noble"))
            .stdout(predicate::str::contains("focal").not());
    }

    #[test]
    fn invalid_config_is_rejected() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("config.toml"), "[build]\njobs = 0\n").unwrap();

        kfx_dist(&dir)
            .arg("--list-targets")
            .assert()
            .failure()
            .stderr(predicate::str::contains("Invalid configuration"));
    }

    #[test]
    fn init_config_writes_defaults() {
        let dir = TempDir::new().unwrap();
        kfx_dist(&dir).arg("--init-config").assert().success();

        let written = std::fs::read_to_string(dir.path().join("config.toml")).unwrap();
        assert!(written.contains("[[targets]]"));

        kfx_dist(&dir)
            .arg("--init-config")
            .assert()
            .failure()
            .stderr(predicate::str::contains("--force"));
    }

    #[test]
    fn zero_jobs_rejected() {
        let dir = TempDir::new().unwrap();
        kfx_dist(&dir)
            .args(["-j", "0", "all"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("at least 1"));
    }
}

mod pipeline_tests {
    use kfx_dist::cache::{DiskCache, IntermediateCache, MemoryCache};
    use kfx_dist::config::Config;
    use kfx_dist::engine::fake::FakeEngine;
    use kfx_dist::orchestrator::{Orchestrator, Outcome};
    use kfx_dist::pipeline::{Pipeline, RunReport};
    use kfx_dist::target::TargetSelector;
    use kfx_dist::DistError;
    use std::collections::BTreeSet;
    use std::path::{Path, PathBuf};
    use std::sync::Arc;
    use tempfile::TempDir;

    struct Workspace {
        dir: TempDir,
        config: Config,
    }

    impl Workspace {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let context = dir.path().join("kvm-vmi");
            std::fs::create_dir_all(context.join("xen/tools")).unwrap();
            std::fs::write(context.join("xen/Makefile"), "dist-xen:\n\t$(MAKE) -C tools\n")
                .unwrap();
            std::fs::write(context.join("xen/tools/Makefile"), "all:\n").unwrap();
            std::fs::create_dir_all(dir.path().join("scratch")).unwrap();

            let mut config = Config::default();
            config.build.context = context;
            config.cache.dir = Some(dir.path().join("cache"));

            Self { dir, config }
        }

        fn out(&self) -> PathBuf {
            self.dir.path().join("out")
        }

        fn pipeline(
            &self,
            engine: Arc<FakeEngine>,
            cache: Arc<dyn IntermediateCache>,
        ) -> Pipeline {
            let orchestrator = Orchestrator::new(engine, cache, &self.config)
                .with_scratch_dir(self.dir.path().join("scratch"));
            Pipeline::new(orchestrator)
        }

        fn disk_cache(&self) -> Arc<DiskCache> {
            Arc::new(DiskCache::new(self.dir.path().join("cache")))
        }
    }

    fn listing(dir: &Path) -> BTreeSet<String> {
        std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect()
    }

    fn expected_packages(distros: &[&str]) -> BTreeSet<String> {
        distros
            .iter()
            .flat_map(|d| FakeEngine::package_names(d))
            .collect()
    }

    async fn run_all(ws: &Workspace, pipeline: &Pipeline) -> RunReport {
        pipeline.run(&TargetSelector::All, &ws.out()).await.unwrap()
    }

    #[tokio::test]
    async fn all_targets_produce_flat_output() {
        let ws = Workspace::new();
        let engine = Arc::new(FakeEngine::new());
        let report = run_all(&ws, &ws.pipeline(engine.clone(), ws.disk_cache())).await;

        assert_eq!(report.outcome, Outcome::Success);
        assert_eq!(report.exit_code(), 0);
        assert_eq!(
            listing(&ws.out()),
            expected_packages(&["buster", "bullseye", "bionic", "focal", "jammy"])
        );
        assert_eq!(report.normalize.decompressed, 5);
        assert!(report.normalize.artifacts.iter().all(|a| !a.compressed));

        let bundle = FakeEngine::package_names("focal")[0].clone();
        assert_eq!(
            std::fs::read(ws.out().join(&bundle)).unwrap(),
            FakeEngine::package_contents(&bundle)
        );
        assert_eq!(engine.live_containers(), 0);

        for result in &report.results {
            assert_eq!(result.output_files.len(), 2);
            for path in &result.output_files {
                assert!(path.is_file(), "{} missing", path.display());
                assert_eq!(path.parent(), Some(ws.out().as_path()));
            }
        }
    }

    #[tokio::test]
    async fn three_of_five_failing_is_partial() {
        let ws = Workspace::new();
        let engine = Arc::new(FakeEngine::new().failing_targets(["buster", "bionic", "jammy"]));
        let report = run_all(&ws, &ws.pipeline(engine, Arc::new(MemoryCache::new()))).await;

        assert_eq!(
            report.outcome,
            Outcome::PartialFailure {
                failed: vec!["buster".into(), "bionic".into(), "jammy".into()]
            }
        );
        assert_eq!(report.exit_code(), 1);
        assert_eq!(report.results.iter().filter(|r| r.is_success()).count(), 2);
        assert_eq!(listing(&ws.out()), expected_packages(&["bullseye", "focal"]));
    }

    #[tokio::test]
    async fn all_failing_is_total_failure() {
        let ws = Workspace::new();
        let engine = Arc::new(FakeEngine::new().failing_intermediate());
        let cache = Arc::new(MemoryCache::new());
        let report = run_all(&ws, &ws.pipeline(engine.clone(), cache.clone())).await;

        assert!(matches!(report.outcome, Outcome::TotalFailure { ref failed } if failed.len() == 5));
        assert!(listing(&ws.out()).is_empty());
        assert_eq!(engine.intermediate_builds(), 1);
        assert_eq!(cache.store_count(), 0);
    }

    #[tokio::test]
    async fn unknown_target_touches_nothing() {
        let ws = Workspace::new();
        let engine = Arc::new(FakeEngine::new());
        let pipeline = ws.pipeline(engine.clone(), ws.disk_cache());

        let err = pipeline
            .run(&TargetSelector::parse("warty"), &ws.out())
            .await
            .unwrap_err();

        assert!(matches!(err, DistError::UnknownTarget { .. }));
        assert!(engine.calls().is_empty());
        assert!(!ws.out().exists());
        assert!(!ws.dir.path().join("cache").exists());
    }

    #[tokio::test]
    async fn disk_cache_reused_across_runs() {
        let ws = Workspace::new();
        let engine = Arc::new(FakeEngine::new());

        run_all(&ws, &ws.pipeline(engine.clone(), ws.disk_cache())).await;
        let second = run_all(&ws, &ws.pipeline(engine.clone(), ws.disk_cache())).await;

        assert_eq!(second.outcome, Outcome::Success);
        assert_eq!(engine.intermediate_builds(), 1);
        assert_eq!(engine.loads(), 1);
    }

    #[tokio::test]
    async fn source_change_invalidates_cache() {
        let ws = Workspace::new();
        let engine = Arc::new(FakeEngine::new());

        run_all(&ws, &ws.pipeline(engine.clone(), ws.disk_cache())).await;
        std::fs::write(ws.config.build.context.join("xen/tools/Makefile"), "all: tools\n").unwrap();
        run_all(&ws, &ws.pipeline(engine.clone(), ws.disk_cache())).await;

        assert_eq!(engine.intermediate_builds(), 2);
        assert_eq!(engine.loads(), 0);
    }

    #[tokio::test]
    async fn report_written_as_json() {
        let ws = Workspace::new();
        let engine = Arc::new(FakeEngine::new().failing_targets(["focal"]));
        let report_path = ws.dir.path().join("reports/run.json");
        let pipeline = ws
            .pipeline(engine, Arc::new(MemoryCache::new()))
            .with_report(Some(report_path.clone()));

        pipeline
            .run(&TargetSelector::parse("focal"), &ws.out())
            .await
            .unwrap();

        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&report_path).unwrap()).unwrap();
        assert_eq!(json["selector"], "focal");
        assert_eq!(json["outcome"]["kind"], "total_failure");
        assert_eq!(json["results"][0]["status"], "failed");
        assert!(json["results"][0]["diagnostics"][0]
            .as_str()
            .unwrap()
            .contains("dpkg-deb"));
    }
}
