use crate::errors::StartProcessError;
use nix::unistd::{access, AccessFlags};
use std::{
	env,
	ffi::OsStr,
	os::unix::ffi::OsStrExt,
	path::{Path, PathBuf},
};

#[cfg(test)]
use {
	assert_matches::assert_matches,
	once_cell::sync::Lazy,
	std::{
		fs,
		os::unix::fs::PermissionsExt,
	},
};

/// Finds the executable that `program` refers to.
///
/// A `program` containing a `/` is a path, relative to the current directory if it is not absolute, and is used as is. Any other `program` is looked up in the directories listed in the `PATH` environment variable, in order. Empty `PATH` entries are skipped rather than treated as the current directory.
///
/// Either way, the result must be a regular file that this process is allowed to execute.
///
///
/// # Errors
///
/// [`StartProcessError::ExecutableNotFound`] if there is no such executable.
pub fn find_executable(program: &OsStr) -> Result<PathBuf, StartProcessError> {
	let not_found = || StartProcessError::ExecutableNotFound {
		program: program.to_owned(),
	};

	if program.is_empty() {
		return Err(not_found());
	}

	if program.as_bytes().contains(&b'/') {
		let path = Path::new(program);

		return match is_executable(path) {
			true => Ok(path.to_owned()),
			false => Err(not_found()),
		};
	}

	let search_path = env::var_os("PATH").ok_or_else(not_found)?;

	env::split_paths(&search_path)
	.filter(|dir| !dir.as_os_str().is_empty())
	.map(|dir| dir.join(program))
	.find(|candidate| is_executable(candidate))
	.ok_or_else(not_found)
}

fn is_executable(path: &Path) -> bool {
	path.metadata().is_ok_and(|metadata| metadata.is_file()) &&
	access(path, AccessFlags::X_OK).is_ok()
}

#[cfg(test)]
pub(crate) static TEST_SCRATCH: Lazy<PathBuf> = Lazy::new(|| {
	let path: PathBuf = ["target", "lib-test-scratch"].into_iter().collect();

	// Try to remove the scratch folder, but ignore errors in doing so.
	let _ = fs::remove_dir_all(&path);

	fs::create_dir_all(&path)
	.expect("couldn't create test scratch folder");

	path
});

#[test]
fn test_find_executable_on_path() {
	let sh = find_executable(OsStr::new("sh")).unwrap();
	assert!(sh.is_absolute());
	assert!(sh.ends_with("sh"));
}

#[test]
fn test_find_executable_by_path() {
	let current_exe = env::current_exe().unwrap();
	assert_eq!(find_executable(current_exe.as_os_str()).unwrap(), current_exe);
}

#[test]
fn test_find_executable_not_found() {
	for program in ["", "no-such-program-for-socket-handoff", "./no/such/program", "/"] {
		assert_matches!(
			find_executable(OsStr::new(program)),
			Err(StartProcessError::ExecutableNotFound { program: p })
			if p == program
		);
	}
}

#[test]
fn test_find_executable_requires_execute_permission() {
	let path = TEST_SCRATCH.join("not-executable");
	fs::write(&path, "#!/bin/sh\n").unwrap();
	fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();

	assert_matches!(
		find_executable(path.as_os_str()),
		Err(StartProcessError::ExecutableNotFound { .. })
	);

	fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
	assert_eq!(find_executable(path.as_os_str()).unwrap(), path);
}
