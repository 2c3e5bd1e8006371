//! Choosing how a checked-out repository is built.

use std::fmt;
use std::path::Path;

use crate::{Step, StepCommand, StepFailure};

/// Repository-provided build script. When present, detection is skipped.
pub const BUILD_SCRIPT: &str = "build.sh";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageManager {
    Pnpm,
    Npm,
    Yarn,
}

impl PackageManager {
    /// Lock files in priority order; the first one present wins.
    const LOCK_FILES: [(&'static str, PackageManager); 3] = [
        ("pnpm-lock.yaml", PackageManager::Pnpm),
        ("package-lock.json", PackageManager::Npm),
        ("yarn.lock", PackageManager::Yarn),
    ];

    pub fn detect(dir: &Path) -> Self {
        Self::LOCK_FILES
            .iter()
            .find(|(lock, _)| dir.join(lock).is_file())
            .map(|(_, pm)| *pm)
            .unwrap_or(PackageManager::Npm)
    }

    pub fn program(self) -> &'static str {
        match self {
            PackageManager::Pnpm => "pnpm",
            PackageManager::Npm => "npm",
            PackageManager::Yarn => "yarn",
        }
    }
}

impl fmt::Display for PackageManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.program())
    }
}

/// A recognised project type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectKind {
    Node(PackageManager),
    Go,
}

impl fmt::Display for ProjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProjectKind::Node(_) => f.write_str("Node.js"),
            ProjectKind::Go => f.write_str("Go"),
        }
    }
}

/// Recognises a project type from the files in a checkout.
pub trait ProjectDetector: Send + Sync {
    fn detect(&self, dir: &Path) -> Option<ProjectKind>;
}

/// Detects projects by their manifest: `package.json`, then `go.mod`.
#[derive(Debug, Default, Clone, Copy)]
pub struct MarkerDetector;

impl ProjectDetector for MarkerDetector {
    fn detect(&self, dir: &Path) -> Option<ProjectKind> {
        if dir.join("package.json").is_file() {
            Some(ProjectKind::Node(PackageManager::detect(dir)))
        } else if dir.join("go.mod").is_file() {
            Some(ProjectKind::Go)
        } else {
            None
        }
    }
}

/// How a checkout will be built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildPlan {
    Script,
    Toolchain(ProjectKind),
}

impl BuildPlan {
    /// A custom script always wins; otherwise ask `detector`.
    pub fn choose(dir: &Path, detector: &dyn ProjectDetector) -> Result<Self, StepFailure> {
        if dir.join(BUILD_SCRIPT).is_file() {
            return Ok(BuildPlan::Script);
        }
        detector
            .detect(dir)
            .map(BuildPlan::Toolchain)
            .ok_or_else(|| StepFailure::new(Step::Detect, "no recognized build strategy"))
    }

    pub fn describe(&self) -> String {
        match self {
            BuildPlan::Script => format!("Executing build script {}", BUILD_SCRIPT),
            BuildPlan::Toolchain(ProjectKind::Node(pm)) => {
                format!("Detected Node.js project, using package manager: {}", pm)
            }
            BuildPlan::Toolchain(ProjectKind::Go) => "Detected Go project".to_string(),
        }
    }

    /// Commands to run in order inside `dir`.
    pub fn commands(&self, dir: &Path) -> Vec<StepCommand> {
        match self {
            BuildPlan::Script => {
                vec![StepCommand::new(Step::Build, "/bin/sh", dir).arg(BUILD_SCRIPT)]
            }
            BuildPlan::Toolchain(ProjectKind::Node(pm)) => vec![
                StepCommand::new(Step::Install, pm.program(), dir).arg("install"),
                StepCommand::new(Step::Build, pm.program(), dir).args(["run", "build"]),
            ],
            // Only the root package; `-o` with several packages needs a directory.
            BuildPlan::Toolchain(ProjectKind::Go) => vec![
                StepCommand::new(Step::Build, "go", dir).args(["build", "-o", "app", "."]),
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn touch(dir: &Path, name: &str) {
        std::fs::write(dir.join(name), "").unwrap();
    }

    #[derive(Default)]
    struct CountingDetector {
        calls: AtomicUsize,
    }

    impl ProjectDetector for CountingDetector {
        fn detect(&self, dir: &Path) -> Option<ProjectKind> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            MarkerDetector.detect(dir)
        }
    }

    #[test]
    fn test_lock_file_priority() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(PackageManager::detect(dir.path()), PackageManager::Npm);

        touch(dir.path(), "yarn.lock");
        assert_eq!(PackageManager::detect(dir.path()), PackageManager::Yarn);

        touch(dir.path(), "package-lock.json");
        assert_eq!(PackageManager::detect(dir.path()), PackageManager::Npm);

        touch(dir.path(), "pnpm-lock.yaml");
        assert_eq!(PackageManager::detect(dir.path()), PackageManager::Pnpm);
    }

    #[test]
    fn test_marker_detection() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(MarkerDetector.detect(dir.path()), None);

        touch(dir.path(), "go.mod");
        assert_eq!(MarkerDetector.detect(dir.path()), Some(ProjectKind::Go));

        touch(dir.path(), "package.json");
        assert_eq!(
            MarkerDetector.detect(dir.path()),
            Some(ProjectKind::Node(PackageManager::Npm))
        );
    }

    #[test]
    fn test_build_script_skips_detection() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "package.json");
        touch(dir.path(), BUILD_SCRIPT);

        let detector = CountingDetector::default();
        let plan = BuildPlan::choose(dir.path(), &detector).unwrap();
        assert_eq!(plan, BuildPlan::Script);
        assert_eq!(detector.calls.load(Ordering::SeqCst), 0);

        let commands = plan.commands(dir.path());
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].program, "/bin/sh");
        assert_eq!(commands[0].args, ["build.sh"]);
    }

    #[test]
    fn test_unknown_project_fails_detection() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "README.md");
        let detector = CountingDetector::default();
        let err = BuildPlan::choose(dir.path(), &detector).unwrap_err();
        assert_eq!(err.step, Step::Detect);
        assert!(err.reason.contains("no recognized build strategy"));
        assert_eq!(detector.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_node_recipe_installs_then_builds() {
        let dir = tempfile::tempdir().unwrap();
        let plan = BuildPlan::Toolchain(ProjectKind::Node(PackageManager::Pnpm));
        let commands = plan.commands(dir.path());
        let lines: Vec<&str> = commands.iter().map(|c| c.display.as_str()).collect();
        assert_eq!(lines, ["pnpm install", "pnpm run build"]);
        assert_eq!(commands[0].step, Step::Install);
        assert_eq!(commands[1].step, Step::Build);
    }

    #[test]
    fn test_go_recipe_builds_the_root_package() {
        let dir = tempfile::tempdir().unwrap();
        let commands = BuildPlan::Toolchain(ProjectKind::Go).commands(dir.path());
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].step, Step::Build);
        assert_eq!(commands[0].program, "go");
        assert_eq!(commands[0].args, ["build", "-o", "app", "."]);
        assert_eq!(commands[0].cwd, dir.path());
    }
}
