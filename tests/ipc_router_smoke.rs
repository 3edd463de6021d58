use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_reportcardd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .env_remove("REPORTCARDD_WORKSPACE")
        .env_remove("REPORTCARDD_CONFIG")
        .spawn()
        .expect("spawn reportcardd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown error")
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn error_code(value: &serde_json::Value) -> String {
    assert_eq!(value.get("ok").and_then(|v| v.as_bool()), Some(false), "{}", value);
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string()
}

fn str_field(v: &serde_json::Value, key: &str) -> String {
    v.get(key)
        .and_then(|v| v.as_str())
        .unwrap_or_else(|| panic!("missing {} in {}", key, v))
        .to_string()
}


fn raw_line(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>, line: &str) -> serde_json::Value {
    writeln!(stdin, "{}", line).expect("write line");
    stdin.flush().expect("flush line");
    let mut out = String::new();
    reader.read_line(&mut out).expect("read response line");
    serde_json::from_str(out.trim()).expect("parse response json")
}

#[test]
fn requests_before_workspace_selection_are_refused() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let health = request_ok(&mut stdin, &mut reader, "1", "health", json!({}));
    assert!(health.get("workspacePath").map(|v| v.is_null()).unwrap_or(false));
    assert_eq!(
        health
            .get("grading")
            .and_then(|g| g.get("scale"))
            .and_then(|v| v.as_f64()),
        Some(20.0)
    );

    let classes = request(&mut stdin, &mut reader, "2", "classes.list", json!({}));
    assert_eq!(
        classes.get("result").and_then(|r| r.get("classes")).and_then(|v| v.as_array()).map(|a| a.len()),
        Some(0)
    );

    for (i, method) in [
        "classes.create",
        "grades.upsert",
        "reportCards.rankClass",
        "settings.updateGrading",
    ]
    .iter()
    .enumerate()
    {
        let res = request(&mut stdin, &mut reader, &format!("nw{}", i), method, json!({}));
        assert_eq!(error_code(&res), "no_workspace", "{}", method);
    }

    let unknown = request(&mut stdin, &mut reader, "3", "marks.teleport", json!({}));
    assert_eq!(error_code(&unknown), "not_implemented");

    let broken = raw_line(&mut stdin, &mut reader, "{not json");
    assert_eq!(broken.get("ok").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(
        broken.get("error").and_then(|e| e.get("code")).and_then(|v| v.as_str()),
        Some("bad_json")
    );

    // The daemon keeps serving after a malformed line.
    let _ = request_ok(&mut stdin, &mut reader, "4", "health", json!({}));

    let _ = child.kill();
    let _ = child.wait();
}

#[test]
fn router_dispatch_smoke_covers_handler_families() {
    let workspace = temp_dir("reportcard-router-smoke");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let health = request_ok(&mut stdin, &mut reader, "2", "health", json!({}));
    assert_eq!(
        health.get("workspacePath").and_then(|v| v.as_str()),
        Some(&*workspace.to_string_lossy())
    );

    let missing_name = request(&mut stdin, &mut reader, "3", "classes.create", json!({ "level": "L1" }));
    assert_eq!(error_code(&missing_name), "bad_params");

    let class_id = str_field(
        &request_ok(
            &mut stdin,
            &mut reader,
            "4",
            "classes.create",
            json!({ "name": "Smoke", "level": "L1" }),
        ),
        "classId",
    );
    let classes = request_ok(&mut stdin, &mut reader, "5", "classes.list", json!({}));
    assert_eq!(
        classes.get("classes").and_then(|v| v.as_array()).map(|a| a.len()),
        Some(1)
    );

    let student_id = str_field(
        &request_ok(
            &mut stdin,
            &mut reader,
            "6",
            "students.upsert",
            json!({ "classId": class_id, "lastName": "Moss", "firstName": "Ada", "sortOrder": 5 }),
        ),
        "studentId",
    );
    // Updating without sortOrder keeps the roster position.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "students.upsert",
        json!({ "classId": class_id, "studentId": student_id, "lastName": "Moss", "firstName": "Ada Jane" }),
    );
    let students = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "students.list",
        json!({ "classId": class_id }),
    );
    let rows = students.get("students").and_then(|v| v.as_array()).expect("students");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("firstName").and_then(|v| v.as_str()), Some("Ada Jane"));
    assert_eq!(rows[0].get("sortOrder").and_then(|v| v.as_i64()), Some(5));

    let subjects = request_ok(&mut stdin, &mut reader, "9", "subjects.list", json!({}));
    assert_eq!(
        subjects.get("subjects").and_then(|v| v.as_array()).map(|a| a.len()),
        Some(0)
    );
    let coefficients = request_ok(&mut stdin, &mut reader, "10", "coefficients.list", json!({}));
    assert_eq!(
        coefficients.get("coefficients").and_then(|v| v.as_array()).map(|a| a.len()),
        Some(0)
    );

    let key = json!({ "classId": class_id, "year": "2025-2026", "period": 1 });
    let evaluations = request_ok(&mut stdin, &mut reader, "11", "evaluations.list", key.clone());
    assert_eq!(
        evaluations.get("evaluations").and_then(|v| v.as_array()).map(|a| a.len()),
        Some(0)
    );

    let empty_rank = request_ok(&mut stdin, &mut reader, "12", "reportCards.rankClass", key.clone());
    assert_eq!(
        empty_rank.get("reportCards").and_then(|v| v.as_array()).map(|a| a.len()),
        Some(0)
    );
    let listed = request_ok(&mut stdin, &mut reader, "13", "reportCards.list", key.clone());
    assert_eq!(
        listed.get("reportCards").and_then(|v| v.as_array()).map(|a| a.len()),
        Some(0)
    );

    let mut get_params = key.clone();
    get_params["studentId"] = json!(student_id);
    let not_generated = request(&mut stdin, &mut reader, "14", "reportCards.get", get_params);
    assert_eq!(error_code(&not_generated), "not_found");

    let unknown_class = request(
        &mut stdin,
        &mut reader,
        "15",
        "reportCards.generateClass",
        json!({ "classId": "missing", "year": "2025-2026", "period": 1 }),
    );
    assert_eq!(error_code(&unknown_class), "not_found");

    let no_year = request(
        &mut stdin,
        &mut reader,
        "16",
        "reportCards.list",
        json!({ "classId": class_id, "period": 1 }),
    );
    assert_eq!(error_code(&no_year), "bad_params");

    let _ = child.kill();
    let _ = child.wait();
}

#[test]
fn workspace_grading_override_survives_reopen() {
    let workspace = temp_dir("reportcard-grading-override");
    {
        let (mut child, mut stdin, mut reader) = spawn_sidecar();
        let _ = request_ok(
            &mut stdin,
            &mut reader,
            "1",
            "workspace.select",
            json!({ "path": workspace.to_string_lossy() }),
        );
        let bad = request(
            &mut stdin,
            &mut reader,
            "2",
            "settings.updateGrading",
            json!({ "scale": -5 }),
        );
        assert_eq!(error_code(&bad), "bad_params");
        let updated = request_ok(
            &mut stdin,
            &mut reader,
            "3",
            "settings.updateGrading",
            json!({ "scale": 100.0, "workers": 2 }),
        );
        assert_eq!(
            updated
                .get("grading")
                .and_then(|g| g.get("scale"))
                .and_then(|v| v.as_f64()),
            Some(100.0)
        );
        let _ = child.kill();
        let _ = child.wait();
    }

    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let health = request_ok(&mut stdin, &mut reader, "2", "health", json!({}));
    let grading = health.get("grading").expect("grading");
    assert_eq!(grading.get("scale").and_then(|v| v.as_f64()), Some(100.0));
    assert_eq!(grading.get("workers").and_then(|v| v.as_u64()), Some(2));

    let _ = child.kill();
    let _ = child.wait();
}
