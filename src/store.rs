use std::path::{Path, PathBuf};

use anyhow::Context as _;
use async_trait::async_trait;
use tokio::fs;

use crate::admission::EntitlementSource;
use crate::formats::{
    Account, AnalysisResult, BonusTopic, Chapter, ChapterBrief, Fact, GenerationState, GlobalPlan,
    Session,
};

/// Persisted state produced and consumed by the pipeline.
#[async_trait]
pub trait BookStore: Send + Sync {
    async fn get_account(&self, user_id: &str) -> anyhow::Result<Option<Account>>;
    async fn put_account(&self, account: &Account) -> anyhow::Result<()>;

    async fn get_session(&self, user_id: &str, session_id: &str)
    -> anyhow::Result<Option<Session>>;
    async fn put_session(&self, session: &Session) -> anyhow::Result<()>;
    async fn list_sessions(&self, user_id: &str) -> anyhow::Result<Vec<Session>>;

    async fn append_facts(
        &self,
        user_id: &str,
        session_id: &str,
        facts: &[Fact],
    ) -> anyhow::Result<()>;
    async fn list_facts(&self, user_id: &str, session_id: &str) -> anyhow::Result<Vec<Fact>>;

    async fn get_analysis(
        &self,
        user_id: &str,
        session_id: &str,
    ) -> anyhow::Result<Option<AnalysisResult>>;
    async fn put_analysis(
        &self,
        user_id: &str,
        session_id: &str,
        analysis: &AnalysisResult,
    ) -> anyhow::Result<()>;

    async fn list_bonus_topics(&self, user_id: &str) -> anyhow::Result<Vec<BonusTopic>>;
    async fn add_bonus_topic(&self, user_id: &str, topic: &BonusTopic) -> anyhow::Result<()>;

    async fn get_glossary(&self, user_id: &str) -> anyhow::Result<Vec<String>>;
    async fn put_glossary(&self, user_id: &str, entries: &[String]) -> anyhow::Result<()>;

    async fn get_plan(&self, user_id: &str) -> anyhow::Result<Option<GlobalPlan>>;
    async fn put_plan(&self, user_id: &str, plan: &GlobalPlan) -> anyhow::Result<()>;
    async fn delete_plan(&self, user_id: &str) -> anyhow::Result<()>;

    async fn list_briefs(&self, user_id: &str) -> anyhow::Result<Vec<ChapterBrief>>;
    /// Replaces any brief with the same `chapter_order`.
    async fn upsert_brief(&self, user_id: &str, brief: &ChapterBrief) -> anyhow::Result<()>;
    async fn clear_briefs(&self, user_id: &str) -> anyhow::Result<()>;

    async fn get_state(&self, user_id: &str) -> anyhow::Result<Option<GenerationState>>;
    async fn put_state(&self, user_id: &str, state: &GenerationState) -> anyhow::Result<()>;

    /// Chapters ordered by `chapter_order`.
    async fn list_chapters(&self, user_id: &str) -> anyhow::Result<Vec<Chapter>>;
    async fn get_chapter(&self, user_id: &str, chapter_order: u32)
    -> anyhow::Result<Option<Chapter>>;
    async fn put_chapter(&self, user_id: &str, chapter: &Chapter) -> anyhow::Result<()>;
    /// Returns the number of chapters removed.
    async fn delete_chapters(&self, user_id: &str) -> anyhow::Result<usize>;
}

/// JSON files under `<base_dir>/users/<user_id>/`.
#[derive(Debug, Clone)]
pub struct LocalFsBookStore {
    base_dir: PathBuf,
}

impl LocalFsBookStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    fn user_dir(&self, user_id: &str) -> anyhow::Result<PathBuf> {
        Ok(self.base_dir.join("users").join(safe_component(user_id)?))
    }

    fn session_dir(&self, user_id: &str, session_id: &str) -> anyhow::Result<PathBuf> {
        Ok(self
            .user_dir(user_id)?
            .join("sessions")
            .join(safe_component(session_id)?))
    }

    fn chapters_dir(&self, user_id: &str) -> anyhow::Result<PathBuf> {
        Ok(self.user_dir(user_id)?.join("chapters"))
    }

    fn chapter_path(&self, user_id: &str, chapter_order: u32) -> anyhow::Result<PathBuf> {
        Ok(self
            .chapters_dir(user_id)?
            .join(format!("ch{chapter_order:03}.json")))
    }
}

#[async_trait]
impl BookStore for LocalFsBookStore {
    async fn get_account(&self, user_id: &str) -> anyhow::Result<Option<Account>> {
        let path = self.user_dir(user_id)?.join("account.json");
        read_json(&path)
            .await
            .with_context(|| format!("read: {}", path.display()))
    }

    async fn put_account(&self, account: &Account) -> anyhow::Result<()> {
        let path = self.user_dir(&account.user_id)?.join("account.json");
        write_json_atomic(&path, account)
            .await
            .context("write account.json")
    }

    async fn get_session(
        &self,
        user_id: &str,
        session_id: &str,
    ) -> anyhow::Result<Option<Session>> {
        let path = self.session_dir(user_id, session_id)?.join("session.json");
        read_json(&path)
            .await
            .with_context(|| format!("read: {}", path.display()))
    }

    async fn put_session(&self, session: &Session) -> anyhow::Result<()> {
        let path = self
            .session_dir(&session.owner, &session.session_id)?
            .join("session.json");
        write_json_atomic(&path, session)
            .await
            .context("write session.json")
    }

    async fn list_sessions(&self, user_id: &str) -> anyhow::Result<Vec<Session>> {
        let sessions_dir = self.user_dir(user_id)?.join("sessions");
        let mut sessions = Vec::new();
        for name in list_dir_names(&sessions_dir).await? {
            let path = sessions_dir.join(&name).join("session.json");
            if let Some(session) = read_json::<Session>(&path)
                .await
                .with_context(|| format!("read: {}", path.display()))?
            {
                sessions.push(session);
            }
        }
        sessions.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.session_id.cmp(&b.session_id))
        });
        Ok(sessions)
    }

    async fn append_facts(
        &self,
        user_id: &str,
        session_id: &str,
        facts: &[Fact],
    ) -> anyhow::Result<()> {
        if facts.is_empty() {
            return Ok(());
        }
        let path = self.session_dir(user_id, session_id)?.join("facts.json");
        let mut all: Vec<Fact> = read_json(&path)
            .await
            .with_context(|| format!("read: {}", path.display()))?
            .unwrap_or_default();
        all.extend_from_slice(facts);
        write_json_atomic(&path, &all)
            .await
            .context("write facts.json")
    }

    async fn list_facts(&self, user_id: &str, session_id: &str) -> anyhow::Result<Vec<Fact>> {
        let path = self.session_dir(user_id, session_id)?.join("facts.json");
        Ok(read_json(&path)
            .await
            .with_context(|| format!("read: {}", path.display()))?
            .unwrap_or_default())
    }

    async fn get_analysis(
        &self,
        user_id: &str,
        session_id: &str,
    ) -> anyhow::Result<Option<AnalysisResult>> {
        let path = self.session_dir(user_id, session_id)?.join("analysis.json");
        read_json(&path)
            .await
            .with_context(|| format!("read: {}", path.display()))
    }

    async fn put_analysis(
        &self,
        user_id: &str,
        session_id: &str,
        analysis: &AnalysisResult,
    ) -> anyhow::Result<()> {
        let path = self.session_dir(user_id, session_id)?.join("analysis.json");
        write_json_atomic(&path, analysis)
            .await
            .context("write analysis.json")
    }

    async fn list_bonus_topics(&self, user_id: &str) -> anyhow::Result<Vec<BonusTopic>> {
        let path = self.user_dir(user_id)?.join("bonus_topics.json");
        Ok(read_json(&path)
            .await
            .with_context(|| format!("read: {}", path.display()))?
            .unwrap_or_default())
    }

    async fn add_bonus_topic(&self, user_id: &str, topic: &BonusTopic) -> anyhow::Result<()> {
        let mut topics = self.list_bonus_topics(user_id).await?;
        topics.push(topic.clone());
        let path = self.user_dir(user_id)?.join("bonus_topics.json");
        write_json_atomic(&path, &topics)
            .await
            .context("write bonus_topics.json")
    }

    async fn get_glossary(&self, user_id: &str) -> anyhow::Result<Vec<String>> {
        let path = self.user_dir(user_id)?.join("glossary.json");
        Ok(read_json(&path)
            .await
            .with_context(|| format!("read: {}", path.display()))?
            .unwrap_or_default())
    }

    async fn put_glossary(&self, user_id: &str, entries: &[String]) -> anyhow::Result<()> {
        let path = self.user_dir(user_id)?.join("glossary.json");
        write_json_atomic(&path, &entries)
            .await
            .context("write glossary.json")
    }

    async fn get_plan(&self, user_id: &str) -> anyhow::Result<Option<GlobalPlan>> {
        let path = self.user_dir(user_id)?.join("plan.json");
        read_json(&path)
            .await
            .with_context(|| format!("read: {}", path.display()))
    }

    async fn put_plan(&self, user_id: &str, plan: &GlobalPlan) -> anyhow::Result<()> {
        let path = self.user_dir(user_id)?.join("plan.json");
        write_json_atomic(&path, plan)
            .await
            .context("write plan.json")
    }

    async fn delete_plan(&self, user_id: &str) -> anyhow::Result<()> {
        let path = self.user_dir(user_id)?.join("plan.json");
        remove_file_if_exists(&path).await
    }

    async fn list_briefs(&self, user_id: &str) -> anyhow::Result<Vec<ChapterBrief>> {
        let path = self.user_dir(user_id)?.join("briefs.json");
        Ok(read_json(&path)
            .await
            .with_context(|| format!("read: {}", path.display()))?
            .unwrap_or_default())
    }

    async fn upsert_brief(&self, user_id: &str, brief: &ChapterBrief) -> anyhow::Result<()> {
        let mut briefs = self.list_briefs(user_id).await?;
        match briefs
            .iter_mut()
            .find(|b| b.chapter_order == brief.chapter_order)
        {
            Some(existing) => *existing = brief.clone(),
            None => briefs.push(brief.clone()),
        }
        let path = self.user_dir(user_id)?.join("briefs.json");
        write_json_atomic(&path, &briefs)
            .await
            .context("write briefs.json")
    }

    async fn clear_briefs(&self, user_id: &str) -> anyhow::Result<()> {
        let path = self.user_dir(user_id)?.join("briefs.json");
        remove_file_if_exists(&path).await
    }

    async fn get_state(&self, user_id: &str) -> anyhow::Result<Option<GenerationState>> {
        let path = self.user_dir(user_id)?.join("generation_state.json");
        read_json(&path)
            .await
            .with_context(|| format!("read: {}", path.display()))
    }

    async fn put_state(&self, user_id: &str, state: &GenerationState) -> anyhow::Result<()> {
        let path = self.user_dir(user_id)?.join("generation_state.json");
        write_json_atomic(&path, state)
            .await
            .context("write generation_state.json")
    }

    async fn list_chapters(&self, user_id: &str) -> anyhow::Result<Vec<Chapter>> {
        let dir = self.chapters_dir(user_id)?;
        let mut chapters = Vec::new();
        for name in list_dir_names(&dir).await? {
            if !name.ends_with(".json") {
                continue;
            }
            let path = dir.join(&name);
            if let Some(chapter) = read_json::<Chapter>(&path)
                .await
                .with_context(|| format!("read: {}", path.display()))?
            {
                chapters.push(chapter);
            }
        }
        chapters.sort_by_key(|c| c.chapter_order);
        Ok(chapters)
    }

    async fn get_chapter(
        &self,
        user_id: &str,
        chapter_order: u32,
    ) -> anyhow::Result<Option<Chapter>> {
        let path = self.chapter_path(user_id, chapter_order)?;
        read_json(&path)
            .await
            .with_context(|| format!("read: {}", path.display()))
    }

    async fn put_chapter(&self, user_id: &str, chapter: &Chapter) -> anyhow::Result<()> {
        let path = self.chapter_path(user_id, chapter.chapter_order)?;
        write_json_atomic(&path, chapter)
            .await
            .with_context(|| format!("write chapter {}", chapter.chapter_order))
    }

    async fn delete_chapters(&self, user_id: &str) -> anyhow::Result<usize> {
        let dir = self.chapters_dir(user_id)?;
        let mut removed = 0usize;
        for name in list_dir_names(&dir).await? {
            if !name.ends_with(".json") {
                continue;
            }
            remove_file_if_exists(&dir.join(&name)).await?;
            removed += 1;
        }
        Ok(removed)
    }
}

#[async_trait]
impl EntitlementSource for LocalFsBookStore {
    async fn is_paid(&self, user_id: &str) -> anyhow::Result<bool> {
        Ok(self
            .get_account(user_id)
            .await?
            .is_some_and(|account| account.paid))
    }
}

/// Validates an id used as a single path component.
pub fn safe_component(id: &str) -> anyhow::Result<&str> {
    let valid = !id.is_empty()
        && id.len() <= 128
        && !id.starts_with('.')
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if !valid {
        anyhow::bail!("invalid id: {id:?}");
    }
    Ok(id)
}

async fn list_dir_names(dir: &Path) -> anyhow::Result<Vec<String>> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err).with_context(|| format!("read dir: {}", dir.display())),
    };
    let mut names = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .with_context(|| format!("read dir entry: {}", dir.display()))?
    {
        let name = entry.file_name().to_string_lossy().to_string();
        // In-flight atomic writes.
        if name.contains(".tmp.") {
            continue;
        }
        names.push(name);
    }
    names.sort();
    Ok(names)
}

async fn remove_file_if_exists(path: &Path) -> anyhow::Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("remove: {}", path.display())),
    }
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<Option<T>> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let value = serde_json::from_slice(&bytes).context("parse json")?;
    Ok(Some(value))
}

async fn write_json_atomic<T: serde::Serialize + ?Sized>(
    path: &Path,
    value: &T,
) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("path has no parent: {}", path.display()))?;
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("create parent dir: {}", parent.display()))?;

    let tmp_path = path.with_extension(format!("tmp.{}", uuid::Uuid::new_v4().simple()));
    let data = serde_json::to_vec_pretty(value).context("serialize json")?;
    fs::write(&tmp_path, &data)
        .await
        .with_context(|| format!("write tmp: {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path)
        .await
        .with_context(|| format!("rename tmp to final: {}", path.display()))?;
    Ok(())
}
