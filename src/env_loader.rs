use std::env;
use std::path::PathBuf;

mod generated {
    include!(concat!(env!("OUT_DIR"), "/harvester_env_allowlist.rs"));
}

const ENV_PREFIX: &str = "HARVESTER_";

fn fallback_dotenv_path(
    harvester_home: Option<PathBuf>,
    home_dir: Option<PathBuf>,
) -> Option<PathBuf> {
    if let Some(base) = harvester_home {
        return Some(base.join(".env"));
    }
    let home = home_dir?;
    Some(home.join(".config").join("social-harvester").join(".env"))
}

pub fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    let fallback = fallback_dotenv_path(
        env::var_os("HARVESTER_HOME").map(PathBuf::from),
        dirs::home_dir(),
    );

    let Some(path) = fallback else {
        return;
    };
    if path.is_file() {
        let _ = dotenvy::from_path(&path);
    }
}

fn unknown_keys<I>(keys: I, allowlist: &[&str]) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    let mut unknown = keys
        .into_iter()
        .filter(|key| key.starts_with(ENV_PREFIX) && !allowlist.contains(&key.as_str()))
        .collect::<Vec<_>>();
    unknown.sort();
    unknown
}

/// `HARVESTER_*` variables set in the environment that nothing reads, usually typos.
pub fn unknown_env_keys() -> Vec<String> {
    unknown_keys(
        env::vars_os().filter_map(|(key, _)| key.into_string().ok()),
        generated::GENERATED_HARVESTER_ENV_ALLOWLIST,
    )
}
