//! Object key minting (§3): `datas3t/{dataset}/dataranges/{min}-{max}-{counter}.tar`
//! and its `.index` sibling. The upload counter is the tiebreaker suffix
//! that keeps keys unique across retried/concurrent uploads.

pub fn data_key(dataset: &str, min_key: i64, max_key: i64, counter: i64) -> String {
    format!("datas3t/{dataset}/dataranges/{min_key:020}-{max_key:020}-{counter:012}.tar")
}

pub fn index_key(dataset: &str, min_key: i64, max_key: i64, counter: i64) -> String {
    format!("{}.index", data_key(dataset, min_key, max_key, counter).trim_end_matches(".tar"))
}

/// The external filename of a single datapoint inside a TAR member.
pub fn datapoint_filename(key: u64, extension: &str) -> String {
    format!("{key:020}.{extension}")
}

/// Parses `datas3t/{dataset}/dataranges/{min}-{max}-{counter}.tar` back
/// into its components, used by the bucket-import reconciliation walk.
pub fn parse_data_key(dataset: &str, key: &str) -> Option<(i64, i64, i64)> {
    let prefix = format!("datas3t/{dataset}/dataranges/");
    let rest = key.strip_prefix(&prefix)?;
    let rest = rest.strip_suffix(".tar")?;
    let mut parts = rest.split('-');
    let min_key: i64 = parts.next()?.parse().ok()?;
    let max_key: i64 = parts.next()?.parse().ok()?;
    let counter: i64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((min_key, max_key, counter))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mints_and_parses_keys() {
        let k = data_key("my-set", 0, 17999, 1);
        assert_eq!(k, "datas3t/my-set/dataranges/00000000000000000000-00000000000000017999-000000000001.tar");
        assert_eq!(index_key("my-set", 0, 17999, 1), "datas3t/my-set/dataranges/00000000000000000000-00000000000000017999-000000000001.index");
        assert_eq!(parse_data_key("my-set", &k), Some((0, 17999, 1)));
    }

    #[test]
    fn datapoint_filename_matches_pattern() {
        assert_eq!(datapoint_filename(42, "jpg"), "00000000000000000042.jpg");
    }
}
