//! Integration tests for the obliq CLI, run against the in-process engine.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

fn obliq_bin() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_obliq"))
}

/// Run obliq in `dir` with the reference engine and an empty config.
fn obliq(dir: &Path, args: &[&str]) -> Output {
    Command::new(obliq_bin())
        .current_dir(dir)
        .args(["--engine", "reference", "--config", "no-such-config.toml"])
        .args(["--scratch-dir", "scratch"])
        .args(args)
        .env_remove("RUST_LOG")
        .output()
        .expect("Failed to execute command")
}

fn write(dir: &Path, name: &str, contents: &str) {
    fs::write(dir.join(name), contents).unwrap();
}

fn read(dir: &Path, name: &str) -> String {
    fs::read_to_string(dir.join(name)).unwrap()
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

#[test]
fn test_help() {
    let output = Command::new(obliq_bin())
        .arg("--help")
        .output()
        .expect("Failed to execute command");

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("oblivious integer engine"));
    for command in ["filter", "join", "aggregate", "sort", "union", "run", "plan"] {
        assert!(stdout.contains(command), "help lacks {command}");
    }
}

#[test]
fn test_filter() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "t.csv", "id,val\n1,apple\n2,banana\n");

    let output = obliq(
        dir.path(),
        &["filter", "t.csv", "--key", "id", "--payload", "val", "--cmp", "==", "--threshold", "2", "-o", "out.csv"],
    );

    assert!(output.status.success(), "{}", stderr(&output));
    assert_eq!(read(dir.path(), "out.csv"), "id,val\n2,banana\n");
    assert!(dir.path().join("out.time").is_file());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("1 rows"));
}

#[test]
fn test_join() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "p.csv", "id,name\n1,Ada\n2,Alan\n");
    write(dir.path(), "q.csv", "pid,title\n1,Notes\n1,Engine\n3,Other\n");

    let output = obliq(
        dir.path(),
        &[
            "join", "p.csv", "q.csv", "--left-key", "id", "--right-key", "pid", "--left-payload", "name",
            "--right-payload", "title", "--fk", "-o", "j.csv",
        ],
    );

    assert!(output.status.success(), "{}", stderr(&output));
    assert_eq!(read(dir.path(), "j.csv"), "t1.id,t1.name,t2.title\n1,Ada,Notes\n1,Ada,Engine\n");
}

#[test]
fn test_join_then_filter() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "p.csv", "id,age\n1,30\n2,40\n");
    write(dir.path(), "q.csv", "author,score\n1,5\n2,9\n");

    let output = obliq(
        dir.path(),
        &[
            "join", "p.csv", "q.csv", "--left-key", "id", "--right-key", "author", "--left-payload", "age",
            "--right-payload", "score", "--fk", "--where", "age", "--cmp", ">", "--threshold", "35", "-o",
            "o.csv",
        ],
    );

    assert!(output.status.success(), "{}", stderr(&output));
    assert_eq!(read(dir.path(), "o.csv"), "t1.age,t1.id,t2.score\n40,2,9\n");
}

#[test]
fn test_aggregate() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "g.csv", "g,v,p\nb,2,y\na,1,x\na,3,z\n");

    let output = obliq(
        dir.path(),
        &["aggregate", "g.csv", "--group", "g", "--value", "v", "--payload", "p", "-o", "a.csv"],
    );

    assert!(output.status.success(), "{}", stderr(&output));
    assert_eq!(
        read(dir.path(), "a.csv"),
        "g,representative_value,global_aggregate,p\na,1,4,x\nb,2,2,y\n"
    );
}

#[test]
fn test_sort_with_filter() {
    let dir = tempfile::tempdir().unwrap();
    write(
        dir.path(),
        "m.csv",
        "creator,id,created,content\n\
         7,1,2010-01-01T00:00:00Z,old\n\
         7,2,2012-01-01T00:00:00Z,new\n\
         8,3,2011-01-01T00:00:00Z,mid\n\
         7,4,2012-01-01T00:00:00Z,tie\n",
    );

    let output = obliq(
        dir.path(),
        &[
            "sort", "m.csv", "--timestamp", "created", "--id", "id", "--payload", "id,content", "--limit", "2",
            "--where", "creator", "--cmp", "==", "--threshold", "7", "-o", "recent.csv",
        ],
    );

    assert!(output.status.success(), "{}", stderr(&output));
    assert_eq!(read(dir.path(), "recent.csv"), "id,content\n4,tie\n2,new\n");
}

#[test]
fn test_union() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "a.csv", "x,y\n1,2\n");
    write(dir.path(), "b.csv", "x,y\n3,4\n");

    let output = obliq(dir.path(), &["union", "a.csv", "b.csv", "-o", "u.csv"]);

    assert!(output.status.success(), "{}", stderr(&output));
    assert_eq!(read(dir.path(), "u.csv"), "x,y\n1,2\n3,4\n");
}

const FRIENDS: &str = r#"
name: friends-of-one
output: friends.csv
steps:
  - id: forward
    op: join
    left: { input: edges.csv, key: dst, payload: [src] }
    right: { input: nodes.csv, key: id, payload: [name] }
  - id: forward_x
    op: filter
    table: { input: "@forward", key: src, payload: [dst, name] }
    comparator: "=="
    threshold: 1
  - id: backward
    op: join
    left: { input: edges.csv, key: src, payload: [dst] }
    right: { input: nodes.csv, key: id, payload: [name] }
  - id: backward_x
    op: filter
    table: { input: "@backward", key: dst, payload: [src, name] }
    comparator: "=="
    threshold: 1
  - id: all
    op: union
    inputs: ["@forward_x", "@backward_x"]
"#;

#[test]
fn test_run_workflow() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "edges.csv", "src,dst\n1,2\n3,1\n1,4\n");
    write(dir.path(), "nodes.csv", "id,name\n1,X\n2,B\n3,C\n4,D\n");
    write(dir.path(), "friends.yaml", FRIENDS);

    let output = obliq(dir.path(), &["run", "friends.yaml"]);

    assert!(output.status.success(), "{}", stderr(&output));
    assert_eq!(read(dir.path(), "friends.csv"), "t1.src,t1.dst,t2.name\n1,2,B\n1,4,D\n1,3,C\n");
}

#[test]
fn test_plan_lists_steps() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "friends.yaml", FRIENDS);

    let output = obliq(dir.path(), &["plan", "friends.yaml"]);

    assert!(output.status.success(), "{}", stderr(&output));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("friends-of-one (5 steps)"));
    assert!(stdout.contains("2. forward_x: filter @forward where src == 1"));
    assert!(!dir.path().join("friends.csv").exists());
}

#[test]
fn test_plan_rejects_forward_reference() {
    let dir = tempfile::tempdir().unwrap();
    write(
        dir.path(),
        "bad.yaml",
        r#"
output: o.csv
steps:
  - id: first
    op: union
    inputs: ["@second"]
  - id: second
    op: union
    inputs: [a.csv]
"#,
    );

    let output = obliq(dir.path(), &["plan", "bad.yaml"]);

    assert!(!output.status.success());
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn test_missing_column_suggestion() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "t.csv", "id,val\n1,apple\n");

    let output = obliq(
        dir.path(),
        &["filter", "t.csv", "--key", "id", "--payload", "vale", "--cmp", "<", "--threshold", "5", "-o", "out.csv"],
    );

    assert_eq!(output.status.code(), Some(2));
    let err = stderr(&output);
    assert!(err.contains("01_filter"), "{err}");
    assert!(err.contains("'vale' -> 'val'"), "{err}");
}

#[test]
fn test_missing_file_suggestion() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "person.csv", "id\n1\n");

    let output = obliq(
        dir.path(),
        &["filter", "persn.csv", "--key", "id", "--cmp", "==", "--threshold", "1", "-o", "out.csv"],
    );

    assert!(!output.status.success());
    assert!(stderr(&output).contains("Did you mean: person.csv?"));
}

#[test]
fn test_keep_scratch() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "t.csv", "id,val\n1,apple\n2,banana\n");

    let output = obliq(
        dir.path(),
        &[
            "--keep-scratch", "filter", "t.csv", "--key", "id", "--payload", "val", "--cmp", "<", "--threshold",
            "2", "-o", "out.csv",
        ],
    );

    assert!(output.status.success(), "{}", stderr(&output));
    let runs: Vec<_> = fs::read_dir(dir.path().join("scratch")).unwrap().flatten().collect();
    assert_eq!(runs.len(), 1);
    assert!(runs[0].path().join("01_filter_map.txt").is_file());
}

#[test]
fn test_relabel_and_reverse() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "in.txt", "2 0\n5 x|_\n7 y|_\n");

    let output = obliq(
        dir.path(),
        &["relabel", "in.txt", "--operator", "filter", "--map", "map.txt", "-o", "relabeled.txt"],
    );
    assert!(output.status.success(), "{}", stderr(&output));
    let relabeled = read(dir.path(), "relabeled.txt");
    let lines: Vec<&str> = relabeled.lines().collect();
    assert_eq!(lines[0], "2 0");
    assert!(lines[1].starts_with("5 "));
    assert!(lines[2].starts_with("7 "));

    // Engine output: the relabeled rows as they would come back.
    write(dir.path(), "engine_out.txt", &format!("{}\n", lines[2]));
    let output = obliq(
        dir.path(),
        &["reverse", "engine_out.txt", "--operator", "filter", "--map", "map.txt", "-o", "reversed.txt"],
    );
    assert!(output.status.success(), "{}", stderr(&output));
    assert_eq!(read(dir.path(), "reversed.txt"), "7|y|_\n");
}

#[test]
fn test_engines_lists_operators() {
    let dir = tempfile::tempdir().unwrap();
    let output = obliq(dir.path(), &["engines"]);

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for op in ["join", "fk_join", "filter", "aggregate"] {
        assert!(stdout.contains(op));
    }
    assert!(stdout.contains("in-process"));
}

#[test]
fn test_completions() {
    let output = Command::new(obliq_bin())
        .args(["completions", "bash"])
        .output()
        .expect("Failed to execute command");

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("obliq"));
}
