use crate::flatten::FlatProcess;
use log::debug;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::Path;

pub trait ArtifactExt
where
    Self: Sized + Serialize + DeserializeOwned,
{
    /// WARNING: This doesn't support generic types
    fn name() -> &'static str {
        std::any::type_name::<Self>().rsplit("::").next().unwrap_or("artifact")
    }

    fn encode_to_writer<W: std::io::Write>(&self, writer: W) -> anyhow::Result<()> {
        serde_json::to_writer_pretty(writer, self)?;
        Ok(())
    }

    fn save_to<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::File::create(path.as_ref())?;
        self.encode_to_writer(std::io::BufWriter::new(file))?;

        debug!("Saved {} to {:?}", Self::name(), path.as_ref());
        Ok(())
    }

    fn load_from<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let file = std::fs::File::open(path.as_ref())?;
        Ok(serde_json::from_reader(std::io::BufReader::new(file))?)
    }
}

impl ArtifactExt for FlatProcess {}
