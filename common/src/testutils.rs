use anyhow::Context;
use async_recursion::async_recursion;

pub fn create_temp_dir() -> anyhow::Result<tempfile::TempDir> {
    tempfile::Builder::new()
        .prefix("arcsync_test")
        .tempdir()
        .context("failed creating test directory")
}

/// Builds the fixture tree below; the directory is kept after the test
pub async fn setup_test_dir() -> anyhow::Result<std::path::PathBuf> {
    let tmp_dir = create_temp_dir()?.keep();
    // foo
    // |- 0.txt
    // |- bar
    //    |- 1.txt
    //    |- 2.txt
    //    |- 3.txt
    // |- baz
    //    |- 4.txt
    //    |- 5.txt
    let foo_path = tmp_dir.join("foo");
    tokio::fs::create_dir(&foo_path).await?;
    tokio::fs::write(foo_path.join("0.txt"), "0").await?;
    let bar_path = foo_path.join("bar");
    tokio::fs::create_dir(&bar_path).await?;
    tokio::fs::write(bar_path.join("1.txt"), "1").await?;
    tokio::fs::write(bar_path.join("2.txt"), "2").await?;
    tokio::fs::write(bar_path.join("3.txt"), "3").await?;
    let baz_path = foo_path.join("baz");
    tokio::fs::create_dir(&baz_path).await?;
    tokio::fs::write(baz_path.join("4.txt"), "4").await?;
    tokio::fs::write(baz_path.join("5.txt"), "5").await?;
    Ok(tmp_dir)
}

/// Every file under `src` exists under `dst` with the same content
#[async_recursion]
pub async fn check_dirs_identical(
    src: &std::path::Path,
    dst: &std::path::Path,
) -> anyhow::Result<()> {
    let mut src_entries = tokio::fs::read_dir(src).await?;
    while let Some(src_entry) = src_entries.next_entry().await? {
        let src_entry_path = src_entry.path();
        let dst_entry_path = dst.join(src_entry.file_name());
        let src_md = tokio::fs::metadata(&src_entry_path)
            .await
            .with_context(|| format!("source file {:?} is missing", &src_entry_path))?;
        let dst_md = tokio::fs::metadata(&dst_entry_path)
            .await
            .with_context(|| format!("destination file {:?} is missing", &dst_entry_path))?;
        assert_eq!(src_md.is_file(), dst_md.is_file());
        if src_md.is_file() {
            let src_contents = tokio::fs::read(&src_entry_path).await?;
            let dst_contents = tokio::fs::read(&dst_entry_path).await?;
            assert_eq!(src_contents, dst_contents, "{:?} differs", &dst_entry_path);
        } else {
            check_dirs_identical(&src_entry_path, &dst_entry_path).await?;
        }
    }
    Ok(())
}
