//! Artifact store for session output directories.
//!
//! Pure storage: resolves the on-disk layout, persists sealed iterations and
//! the session manifest, and copies the selected result into `final/`. All
//! decisions about *what* to persist live in the orchestrator.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::Serialize;
use tracing::debug;

use crate::session::{Iteration, Session};

/// Resolved paths for one session directory.
#[derive(Debug, Clone)]
pub struct SessionPaths {
    pub dir: PathBuf,
    pub manifest_path: PathBuf,
    pub final_dir: PathBuf,
}

impl SessionPaths {
    pub fn new(output_root: &Path, session_id: &str) -> Self {
        let dir = output_root.join(session_id);
        Self {
            manifest_path: dir.join("manifest.json"),
            final_dir: dir.join("final"),
            dir,
        }
    }

    pub fn iteration(&self, index: u32) -> IterationPaths {
        IterationPaths::new(&self.dir, index)
    }
}

/// Resolved paths for one iteration directory.
#[derive(Debug, Clone)]
pub struct IterationPaths {
    pub dir: PathBuf,
    pub script_path: PathBuf,
    pub scene_path: PathBuf,
    pub render_dir: PathBuf,
    pub outcome_path: PathBuf,
    pub critique_path: PathBuf,
    pub engine_log_path: PathBuf,
    pub render_log_path: PathBuf,
}

impl IterationPaths {
    pub fn new(session_dir: &Path, index: u32) -> Self {
        let dir = session_dir.join("iterations").join(index.to_string());
        Self {
            script_path: dir.join("script.py"),
            scene_path: dir.join("model.blend"),
            render_dir: dir.join("renders"),
            outcome_path: dir.join("outcome.json"),
            critique_path: dir.join("critique.json"),
            engine_log_path: dir.join("engine.log"),
            render_log_path: dir.join("render.log"),
            dir,
        }
    }

    /// Create the iteration directory tree before execution begins.
    pub fn prepare(&self) -> Result<()> {
        fs::create_dir_all(&self.render_dir)
            .with_context(|| format!("create render dir {}", self.render_dir.display()))
    }
}

/// Create the session directory tree. Fails if the directory already exists,
/// so two sessions can never share an output root.
pub fn create_session_dir(paths: &SessionPaths) -> Result<()> {
    if paths.dir.exists() {
        return Err(anyhow!(
            "session directory {} already exists",
            paths.dir.display()
        ));
    }
    fs::create_dir_all(&paths.dir)
        .with_context(|| format!("create session dir {}", paths.dir.display()))?;
    fs::create_dir_all(&paths.final_dir)
        .with_context(|| format!("create final dir {}", paths.final_dir.display()))?;
    Ok(())
}

/// Persist a sealed iteration: script text, outcome, and critique record.
///
/// Scene file, renders, and engine logs are written into the iteration
/// directory by the adapters as they run; this call seals the record.
pub fn write_iteration(paths: &IterationPaths, iteration: &Iteration) -> Result<()> {
    debug!(index = iteration.index, dir = %paths.dir.display(), "sealing iteration");
    fs::create_dir_all(&paths.dir)
        .with_context(|| format!("create iteration dir {}", paths.dir.display()))?;

    // Write in deterministic order to keep artifacts stable.
    fs::write(&paths.script_path, &iteration.script)
        .with_context(|| format!("write {}", paths.script_path.display()))?;
    write_json(&paths.outcome_path, &iteration.outcome)?;
    write_json(&paths.critique_path, &iteration.critique)?;
    Ok(())
}

/// Write the session manifest atomically (temp file + rename).
pub fn write_manifest(paths: &SessionPaths, session: &Session) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(session).context("serialize manifest")?;
    buf.push('\n');
    let tmp_path = paths.manifest_path.with_extension("json.tmp");
    fs::write(&tmp_path, buf)
        .with_context(|| format!("write temp manifest {}", tmp_path.display()))?;
    fs::rename(&tmp_path, &paths.manifest_path)
        .with_context(|| format!("replace manifest {}", paths.manifest_path.display()))?;
    Ok(())
}

/// Reload a session manifest from disk.
pub fn load_manifest(path: &Path) -> Result<Session> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read manifest {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse manifest {}", path.display()))
}

/// Copy the selected iteration's scene file and primary render into
/// `final/`. Missing artifacts (a failed best-effort iteration) are skipped;
/// copying nothing is valid for a session with no successful iteration.
pub fn finalize(paths: &SessionPaths, iteration: &Iteration) -> Result<Vec<PathBuf>> {
    let mut copied = Vec::new();

    if let crate::core::types::ExecutionOutcome::Succeeded { scene_file } = &iteration.outcome
        && scene_file.exists()
    {
        let dest = paths.final_dir.join("model.blend");
        fs::copy(scene_file, &dest)
            .with_context(|| format!("copy scene to {}", dest.display()))?;
        copied.push(dest);
    }

    if let Some(renders) = &iteration.renders {
        let primary = renders.primary();
        if primary.exists() {
            let ext = primary.extension().and_then(|e| e.to_str()).unwrap_or("png");
            let dest = paths.final_dir.join(format!("primary.{ext}"));
            fs::copy(primary, &dest)
                .with_context(|| format!("copy render to {}", dest.display()))?;
            copied.push(dest);
        }
    }

    debug!(count = copied.len(), "final artifacts copied");
    Ok(copied)
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value)?;
    buf.push('\n');
    fs::write(path, buf).with_context(|| format!("write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::rubric::Rubric;
    use crate::core::types::{ExecutionOutcome, RenderSet, RenderView, SessionStatus};
    use crate::test_support::{scored_iteration, sample_session};

    #[test]
    fn iteration_paths_are_stable() {
        let paths = SessionPaths::new(Path::new("/out"), "sess-1").iteration(3);
        assert!(paths.dir.ends_with("sess-1/iterations/3"));
        assert!(paths.script_path.ends_with("script.py"));
        assert!(paths.outcome_path.ends_with("outcome.json"));
        assert!(paths.critique_path.ends_with("critique.json"));
    }

    #[test]
    fn session_dir_creation_refuses_collision() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = SessionPaths::new(temp.path(), "sess-1");
        create_session_dir(&paths).expect("create");
        let err = create_session_dir(&paths).unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    #[test]
    fn sealed_iteration_artifacts_are_written() {
        let temp = tempfile::tempdir().expect("tempdir");
        let session = SessionPaths::new(temp.path(), "sess-1");
        create_session_dir(&session).expect("create");
        let paths = session.iteration(1);

        let mut iteration = scored_iteration(1, 4);
        iteration.script = "print('hello')".to_string();
        write_iteration(&paths, &iteration).expect("write");

        assert_eq!(
            fs::read_to_string(&paths.script_path).expect("script"),
            "print('hello')"
        );
        let outcome: ExecutionOutcome = serde_json::from_str(
            &fs::read_to_string(&paths.outcome_path).expect("outcome"),
        )
        .expect("parse outcome");
        assert_eq!(outcome, iteration.outcome);
        assert!(paths.critique_path.is_file());
    }

    #[test]
    fn manifest_round_trips_status_and_selection() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = SessionPaths::new(temp.path(), "sess-1");
        create_session_dir(&paths).expect("create");

        let mut session = sample_session(temp.path());
        session.status = SessionStatus::Exhausted;
        session.selected = Some(2);
        session.iterations = vec![scored_iteration(1, 4), scored_iteration(2, 7)];

        write_manifest(&paths, &session).expect("write");
        let loaded = load_manifest(&paths.manifest_path).expect("load");
        assert_eq!(loaded.status, SessionStatus::Exhausted);
        assert_eq!(loaded.selected, Some(2));
        assert_eq!(loaded, session);
    }

    #[test]
    fn finalize_copies_scene_and_primary_render() {
        let temp = tempfile::tempdir().expect("tempdir");
        let session = SessionPaths::new(temp.path(), "sess-1");
        create_session_dir(&session).expect("create");
        let iter_paths = session.iteration(1);
        iter_paths.prepare().expect("prepare");

        fs::write(&iter_paths.scene_path, b"scene").expect("scene");
        let view_path = iter_paths.render_dir.join("view_front.png");
        fs::write(&view_path, b"img").expect("render");

        let iteration = Iteration {
            index: 1,
            script: "code".to_string(),
            outcome: ExecutionOutcome::Succeeded {
                scene_file: iter_paths.scene_path.clone(),
            },
            renders: Some(
                RenderSet::new(
                    vec![RenderView {
                        name: "front".to_string(),
                        image: view_path,
                    }],
                    None,
                )
                .expect("render set"),
            ),
            critique: Rubric::default()
                .score(vec![2, 2, 2, 2, 2], Vec::new(), "match".to_string())
                .expect("critique"),
            duration_ms: 10,
        };

        let copied = finalize(&session, &iteration).expect("finalize");
        assert_eq!(copied.len(), 2);
        assert!(session.final_dir.join("model.blend").is_file());
        assert!(session.final_dir.join("primary.png").is_file());
    }

    #[test]
    fn finalize_skips_missing_artifacts() {
        let temp = tempfile::tempdir().expect("tempdir");
        let session = SessionPaths::new(temp.path(), "sess-1");
        create_session_dir(&session).expect("create");

        let copied = finalize(&session, &scored_iteration(1, 0)).expect("finalize");
        assert!(copied.is_empty());
    }
}
