use std::os::unix::fs::PermissionsExt;
use std::time::{Duration, Instant};

use machine_driver_vf::retry::RetryPolicy;
use machine_driver_vf::{DriverConfig, LifecycleState, MachineDriver, VfDriver};

/// Stand-in for vfkit: records its arguments and idles until signalled.
const FAKE_VFKIT: &str = "#!/bin/sh
echo \"$@\" > \"$(dirname \"$0\")/args\"
while true; do sleep 1; done
";

#[test]
fn test_lifecycle_with_fake_backend() {
    machine_driver_vf::logging::init_test();
    let dir = tempfile::tempdir().unwrap();
    let bin = dir.path().join("bin");
    std::fs::create_dir(&bin).unwrap();
    let vfkit = bin.join("vfkit");
    std::fs::write(&vfkit, FAKE_VFKIT).unwrap();
    std::fs::set_permissions(&vfkit, std::fs::Permissions::from_mode(0o755)).unwrap();

    let store = dir.path().join("store");
    let image = dir.path().join("disk.raw");
    std::fs::write(&image, b"disk").unwrap();

    let mut config = DriverConfig::new(&store);
    config.kernel = dir.path().join("vmlinuz");
    config.initrd = dir.path().join("initrd");
    config.cpus = 2;
    config.memory = 1024;
    config.vmnet = false;
    config.image_source_path = Some(image);
    config.backend_path = Some(vfkit);
    config.stop_policy = RetryPolicy::new(50, Duration::from_millis(100));
    config.save(dir.path().join("config.json")).unwrap();

    let mut driver = VfDriver::new(DriverConfig::load(dir.path().join("config.json")).unwrap());
    driver.create().unwrap();
    assert!(driver.config().disk_path().is_file());
    assert_eq!(driver.get_state().unwrap(), LifecycleState::Stopped);

    driver.start().unwrap();
    assert_eq!(driver.get_state().unwrap(), LifecycleState::Running);
    let args = std::fs::read_to_string(bin.join("args")).unwrap();
    assert!(args.starts_with("--cpus 2 --memory 1024 --kernel"));
    assert!(args.contains("--device virtio-rng"));
    assert!(!args.contains("virtio-net"));

    assert!(driver.start().is_err());

    driver.stop().unwrap();
    assert_eq!(driver.get_state().unwrap(), LifecycleState::Stopped);
    assert!(!driver.config().pid_path().exists());

    driver.start().unwrap();
    driver.kill().unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    while driver.get_state().unwrap() != LifecycleState::Stopped {
        assert!(Instant::now() < deadline, "backend survived kill");
        std::thread::sleep(Duration::from_millis(50));
    }
    driver.remove().unwrap();
    assert!(!driver.config().pid_path().exists());
}
